//! Shared mocks and fixtures for Crewflow tests.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::event::{ExecutionEvent, Subscription};
use crewflow_core::flow::{Connection, FlowDefinition, Step, StepType};
use crewflow_core::traits::{CrewRunner, ExecutionStore};
use crewflow_core::types::*;

// ── MemoryStore ─────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    executions: HashMap<ExecutionId, Execution>,
    logs: Vec<LogEntry>,
    spans: Vec<TraceSpan>,
    flows: HashMap<String, FlowDefinition>,
    checkpoints: HashMap<ExecutionId, Checkpoint>,
}

/// In-memory `ExecutionStore` with the same compare-and-set and timestamp
/// behavior as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| CrewflowError::Database(e.to_string()))?;
        Ok(f(&mut tables))
    }
}

impl ExecutionStore for MemoryStore {
    fn insert_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            self.with(|t| {
                t.executions.insert(execution.id.clone(), execution);
            })
        })
    }

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        Box::pin(async move { self.with(|t| t.executions.get(&id).cloned()) })
    }

    fn update_status(
        &self,
        id: &ExecutionId,
        from: &[ExecutionStatus],
        update: StatusUpdate,
    ) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        let from = from.to_vec();
        Box::pin(async move {
            self.with(|t| {
                let exec = t.executions.get_mut(&id)?;
                if !from.contains(&exec.status) {
                    return None;
                }
                let now = Utc::now();
                exec.status = update.status;
                if update.status == ExecutionStatus::Running && exec.started_at.is_none() {
                    exec.started_at = Some(now);
                }
                if update.status.is_terminal() {
                    exec.completed_at = Some(now);
                }
                if let Some(error) = update.error {
                    exec.error = Some(error);
                }
                if let Some(outputs) = update.outputs {
                    exec.outputs = Some(outputs);
                }
                if let Some(state) = update.state {
                    exec.state = Some(state);
                }
                if let Some(metrics) = update.metrics {
                    exec.metrics = metrics;
                }
                Some(exec.clone())
            })
        })
    }

    fn save_state(&self, id: &ExecutionId, state: &Value) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        let state = state.clone();
        Box::pin(async move {
            self.with(|t| {
                if let Some(exec) = t.executions.get_mut(&id) {
                    exec.state = Some(state);
                }
            })
        })
    }

    fn append_log(&self, entry: &LogEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();
        Box::pin(async move { self.with(|t| t.logs.push(entry)) })
    }

    fn list_logs(
        &self,
        id: &ExecutionId,
        level: Option<LogLevel>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<LogEntry>>> {
        let id = id.clone();
        Box::pin(async move {
            self.with(|t| {
                t.logs
                    .iter()
                    .filter(|l| l.execution_id == id)
                    .filter(|l| level.map_or(true, |lvl| l.level == lvl))
                    .take(limit)
                    .cloned()
                    .collect()
            })
        })
    }

    fn append_span(&self, span: &TraceSpan) -> BoxFuture<'_, Result<()>> {
        let span = span.clone();
        Box::pin(async move { self.with(|t| t.spans.push(span)) })
    }

    fn list_spans(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<TraceSpan>>> {
        let id = id.clone();
        Box::pin(async move {
            self.with(|t| {
                t.spans
                    .iter()
                    .filter(|s| s.execution_id == id)
                    .cloned()
                    .collect()
            })
        })
    }

    fn save_flow(&self, flow: &FlowDefinition) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();
        Box::pin(async move {
            self.with(|t| {
                t.flows.insert(flow.id.clone(), flow);
            })
        })
    }

    fn load_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move { self.with(|t| t.flows.get(&flow_id).cloned()) })
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            self.with(|t| {
                t.checkpoints
                    .insert(checkpoint.execution_id.clone(), checkpoint);
            })
        })
    }

    fn load_checkpoint(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let id = id.clone();
        Box::pin(async move { self.with(|t| t.checkpoints.get(&id).cloned()) })
    }

    fn delete_checkpoint(&self, id: &ExecutionId) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        Box::pin(async move {
            self.with(|t| {
                t.checkpoints.remove(&id);
            })
        })
    }
}

// ── MockCrewRunner ──────────────────────────────────────────────

enum CrewResponse {
    Output(CrewOutput),
    Failure(String),
}

/// Crew runner with canned per-crew responses.
///
/// Crews without a configured response return `{"crew_id": ..}` and no usage.
#[derive(Default)]
pub struct MockCrewRunner {
    responses: Mutex<HashMap<String, CrewResponse>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MockCrewRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, crew_id: &str, output: CrewOutput) {
        self.responses
            .lock()
            .unwrap()
            .insert(crew_id.to_string(), CrewResponse::Output(output));
    }

    pub fn fail_with(&self, crew_id: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(crew_id.to_string(), CrewResponse::Failure(message.to_string()));
    }

    /// Every call so far: crew id and the inputs it received.
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CrewRunner for MockCrewRunner {
    fn run_crew(
        &self,
        crew_id: &str,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'_, Result<CrewOutput>> {
        self.calls
            .lock()
            .unwrap()
            .push((crew_id.to_string(), inputs));

        let result = match self.responses.lock().unwrap().get(crew_id) {
            Some(CrewResponse::Output(output)) => Ok(output.clone()),
            Some(CrewResponse::Failure(message)) => {
                Err(CrewflowError::CrewExecution(message.clone()))
            }
            None => Ok(CrewOutput {
                outputs: serde_json::json!({ "crew_id": crew_id }),
                metrics: ExecutionMetrics::default(),
            }),
        };
        Box::pin(async move { result })
    }
}

// ── Events ──────────────────────────────────────────────────────

/// Everything already delivered to a subscription, without waiting.
pub fn drain_events(sub: &mut Subscription) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

/// Receive events until a final one (`complete`, `error`, `cancelled`).
pub async fn collect_until_final(sub: &mut Subscription) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.recv().await {
        let done = event.is_final();
        events.push(event);
        if done {
            break;
        }
    }
    events
}

// ── FlowBuilder ─────────────────────────────────────────────────

/// Fluent builder for flow definitions.
///
/// Step-modifying calls (`order`, `max_visits`, `config`) apply to the step
/// with the given id.
pub struct FlowBuilder {
    def: FlowDefinition,
}

impl FlowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            def: FlowDefinition {
                id: id.to_string(),
                name: id.to_string(),
                description: None,
                persistence_enabled: false,
                steps: Vec::new(),
                connections: Vec::new(),
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.def.name = name.to_string();
        self
    }

    /// Keep the flow state on the execution record.
    pub fn persistent(mut self) -> Self {
        self.def.persistence_enabled = true;
        self
    }

    pub fn step(mut self, id: &str, step_type: StepType) -> Self {
        self.def.steps.push(Step::new(id, step_type));
        self
    }

    pub fn step_with(mut self, id: &str, step_type: StepType, config: Value) -> Self {
        let mut step = Step::new(id, step_type);
        step.config = config.as_object().cloned().unwrap_or_default();
        self.def.steps.push(step);
        self
    }

    pub fn crew(self, id: &str, crew_id: &str) -> Self {
        self.step_with(id, StepType::Crew, serde_json::json!({ "crew_id": crew_id }))
    }

    pub fn function(self, id: &str, function_name: &str) -> Self {
        self.step_with(
            id,
            StepType::Function,
            serde_json::json!({ "function_name": function_name }),
        )
    }

    pub fn router(self, id: &str, config: Value) -> Self {
        self.step_with(id, StepType::Router, config)
    }

    pub fn order(mut self, id: &str, order: i64) -> Self {
        if let Some(step) = self.def.steps.iter_mut().find(|s| s.id == id) {
            step.order = order;
        }
        self
    }

    pub fn max_visits(mut self, id: &str, max_visits: u32) -> Self {
        if let Some(step) = self.def.steps.iter_mut().find(|s| s.id == id) {
            step.max_visits = Some(max_visits);
        }
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.def.connections.push(Connection::new(source, target));
        self
    }

    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.def
            .connections
            .push(Connection::new(source, target).when(condition));
        self
    }

    pub fn connect_route(mut self, source: &str, target: &str, route: &str) -> Self {
        self.def
            .connections
            .push(Connection::new(source, target).route(route));
        self
    }

    pub fn build(self) -> FlowDefinition {
        self.def
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Object literal to map; panics on non-objects.
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Write a TOML config to a temp dir and return (dir, path).
pub fn temp_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crewflow.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}
