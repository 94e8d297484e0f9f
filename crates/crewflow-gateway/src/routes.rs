use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crewflow_core::error::CrewflowError;
use crewflow_core::flow::FlowDefinition;
use crewflow_core::types::{Execution, ExecutionId, LogLevel};

use crate::connection;
use crate::state::AppState;

/// Engine error rendered as an HTTP response.
pub struct ApiError(CrewflowError);

impl From<CrewflowError> for ApiError {
    fn from(e: CrewflowError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CrewflowError::FlowNotFound(_)
            | CrewflowError::ExecutionNotFound(_)
            | CrewflowError::CheckpointNotFound(_) => StatusCode::NOT_FOUND,
            CrewflowError::CannotCancel { .. } | CrewflowError::InvalidState { .. } => {
                StatusCode::BAD_REQUEST
            }
            CrewflowError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CrewflowError::Graph(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CrewflowError::Json(_) | CrewflowError::Expr(_) => StatusCode::BAD_REQUEST,
            CrewflowError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn summary(execution: &Execution) -> Value {
    json!({
        "execution_id": execution.id,
        "status": execution.status,
        "outputs": execution.outputs,
        "error": execution.error,
    })
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/flows
pub async fn save_flow(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<FlowDefinition>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let graph = state.service.save_flow(&definition).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": definition.id, "steps_count": graph.steps_count() })),
    ))
}

// GET /api/flows/{id}
pub async fn get_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let flow = state.service.get_flow(&id).await?;
    Ok(Json(serde_json::to_value(flow).map_err(CrewflowError::from)?))
}

fn default_async() -> bool {
    true
}

#[derive(Deserialize)]
pub struct FlowKickoff {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub initial_state: Map<String, Value>,
    #[serde(default = "default_async")]
    pub async_execution: bool,
}

// POST /api/flows/{id}/kickoff
pub async fn kickoff_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<FlowKickoff>,
) -> ApiResult {
    let execution = state
        .service
        .kickoff_flow(&id, body.inputs, body.initial_state, body.async_execution, "api")
        .await?;
    info!(execution_id = %execution.id, flow_id = %id, "Flow kicked off");
    Ok(Json(summary(&execution)))
}

#[derive(Deserialize)]
pub struct CrewKickoff {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default = "default_async")]
    pub async_execution: bool,
}

// POST /api/crews/{id}/kickoff
pub async fn kickoff_crew(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CrewKickoff>,
) -> ApiResult {
    let execution = state
        .service
        .kickoff_crew(&id, body.inputs, body.async_execution, "api")
        .await?;
    info!(execution_id = %execution.id, crew_id = %id, "Crew kicked off");
    Ok(Json(summary(&execution)))
}

// GET /api/executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let execution = state.service.get(&ExecutionId(id)).await?;
    Ok(Json(serde_json::to_value(execution).map_err(CrewflowError::from)?))
}

// POST /api/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let execution = state.service.cancel(&ExecutionId(id)).await?;
    Ok(Json(summary(&execution)))
}

#[derive(Deserialize)]
pub struct FeedbackBody {
    #[serde(default)]
    pub feedback: Value,
}

// POST /api/executions/{id}/human-feedback
pub async fn human_feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackBody>,
) -> ApiResult {
    let execution = state
        .service
        .submit_feedback(&ExecutionId(id), body.feedback)
        .await?;
    Ok(Json(summary(&execution)))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

// GET /api/executions/{id}/logs?level=info&limit=100
pub async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Value>, Response> {
    let level = match q.level.as_deref() {
        Some(l) => Some(l.parse::<LogLevel>().map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(json!({ "detail": e }))).into_response()
        })?),
        None => None,
    };
    let logs = state
        .service
        .logs(&ExecutionId(id), level, q.limit)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(json!({ "logs": logs })))
}

// GET /api/executions/{id}/traces
pub async fn execution_traces(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let spans = state.service.traces(&ExecutionId(id)).await?;
    Ok(Json(json!({ "spans": spans })))
}

// GET /ws/executions/{id}
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, ExecutionId(id)))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, id: ExecutionId) {
    info!(execution_id = %id, "Execution observer connected");
    connection::handle_connection(socket, state.service.clone(), id.clone()).await;
    debug!(execution_id = %id, "Execution observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use axum::body::Body;
    use axum::http::Request;
    use crewflow_core::config::{ServerConfig, WorkerConfig};
    use crewflow_core::event::EventBroadcaster;
    use crewflow_core::flow::StepType;
    use crewflow_engine::{ExecutionService, FunctionRegistry};
    use crewflow_test_utils::{FlowBuilder, MemoryStore, MockCrewRunner};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app() -> axum::Router {
        let (service, _task) = ExecutionService::start(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBroadcaster::local(64)),
            Arc::new(MockCrewRunner::new()),
            FunctionRegistry::new(),
            &WorkerConfig::default(),
            CancellationToken::new(),
        );
        router(Arc::new(AppState {
            config: ServerConfig::default(),
            service: Arc::new(service),
        }))
    }

    async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn review_flow() -> Value {
        let def = FlowBuilder::new("review")
            .step("start", StepType::Start)
            .step("ask", StepType::HumanFeedback)
            .step("end", StepType::End)
            .connect("start", "ask")
            .connect("ask", "end")
            .build();
        serde_json::to_value(def).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_invalid_flow_is_422() {
        let app = app();
        let bad = serde_json::to_value(FlowBuilder::new("bad").step("end", StepType::End).build())
            .unwrap();
        let (status, body) = call(&app, "POST", "/api/flows", Some(bad)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("no start step"));
    }

    #[tokio::test]
    async fn test_unknown_resources_are_404() {
        let app = app();
        let (status, _) = call(&app, "GET", "/api/flows/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/executions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            &app,
            "POST",
            "/api/flows/nope/kickoff",
            Some(json!({"inputs": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_kickoff_feedback_and_cancel_rules() {
        let app = app();
        let (status, _) = call(&app, "POST", "/api/flows", Some(review_flow())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &app,
            "POST",
            "/api/flows/review/kickoff",
            Some(json!({"inputs": {"topic": "rust"}, "async_execution": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting_human");
        let id = body["execution_id"].as_str().unwrap().to_string();

        // Waiting runs cannot be cancelled
        let (status, _) = call(&app, "POST", &format!("/api/executions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/executions/{}/human-feedback", id),
            Some(json!({"feedback": "looks good"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, body) = call(&app, "GET", &format!("/api/executions/{}/logs", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["logs"].as_array().unwrap().is_empty());

        let (status, _) = call(
            &app,
            "GET",
            &format!("/api/executions/{}/logs?level=loud", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "GET", &format!("/api/executions/{}/traces", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["spans"].is_array());
    }
}
