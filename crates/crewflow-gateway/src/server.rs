use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crewflow_core::config::ServerConfig;
use crewflow_engine::ExecutionService;

use crate::routes;
use crate::state::AppState;

/// Build the HTTP + WebSocket router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = state.config.cors_permissive;
    let app = Router::new()
        // WebSocket
        .route("/ws/executions/{id}", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route("/api/flows", post(routes::save_flow))
        .route("/api/flows/{id}", get(routes::get_flow))
        .route("/api/flows/{id}/kickoff", post(routes::kickoff_flow))
        .route("/api/crews/{id}/kickoff", post(routes::kickoff_crew))
        .route("/api/executions/{id}", get(routes::get_execution))
        .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
        .route(
            "/api/executions/{id}/human-feedback",
            post(routes::human_feedback),
        )
        .route("/api/executions/{id}/logs", get(routes::execution_logs))
        .route("/api/executions/{id}/traces", get(routes::execution_traces));

    let app = if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    };
    app.with_state(state)
}

/// HTTP + WebSocket gateway over the execution service, built on axum.
pub struct GatewayServer {
    config: ServerConfig,
    service: Arc<ExecutionService>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig, service: Arc<ExecutionService>) -> Self {
        Self { config, service }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            service: self.service.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_core::config::WorkerConfig;
    use crewflow_core::event::EventBroadcaster;
    use crewflow_core::flow::StepType;
    use crewflow_engine::FunctionRegistry;
    use crewflow_test_utils::{FlowBuilder, MemoryStore, MockCrewRunner};
    use futures::{SinkExt, StreamExt};
    use serde_json::{Map, Value};
    use tokio_tungstenite::tungstenite::Message;

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_ws_observer_sees_feedback_round_trip() {
        let (service, _task) = ExecutionService::start(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBroadcaster::local(64)),
            Arc::new(MockCrewRunner::new()),
            FunctionRegistry::new(),
            &WorkerConfig::default(),
            CancellationToken::new(),
        );
        let service = Arc::new(service);
        let flow = FlowBuilder::new("review")
            .step("start", StepType::Start)
            .step("ask", StepType::HumanFeedback)
            .step("end", StepType::End)
            .connect("start", "ask")
            .connect("ask", "end")
            .build();
        service.save_flow(&flow).await.unwrap();
        let exec = service
            .kickoff_flow("review", Map::new(), Map::new(), false, "api")
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(AppState {
            config: ServerConfig::default(),
            service: service.clone(),
        }));
        tokio::spawn(async move { axum::serve(listener, app).await });

        let url = format!("ws://{}/ws/executions/{}", addr, exec.id);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let connected = next_json(&mut ws).await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["status"], "waiting_human");

        ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "pong");

        ws.send(Message::Text(
            r#"{"type":"human_feedback","feedback":"ship it"}"#.into(),
        ))
        .await
        .unwrap();

        // The feedback reply may land before or after the run events
        let mut types = Vec::new();
        loop {
            let frame = next_json(&mut ws).await;
            let kind = frame["type"].as_str().unwrap().to_string();
            let last = kind == "complete";
            types.push(kind);
            if last {
                break;
            }
        }
        assert!(types.contains(&"feedback_received".to_string()));
        assert!(types.contains(&"step_start".to_string()));
    }
}
