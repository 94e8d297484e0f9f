use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::event::TransportEnvelope;
use crate::flow::FlowDefinition;
use crate::types::*;

/// Crew runner: the external multi-agent pipeline capability.
///
/// Opaque to the engine: inputs in, outputs and usage metrics out.
pub trait CrewRunner: Send + Sync + 'static {
    fn run_crew(&self, crew_id: &str, inputs: Map<String, Value>)
        -> BoxFuture<'_, Result<CrewOutput>>;
}

/// Execution store: persistence backend for runs, logs, spans, flows and checkpoints.
pub trait ExecutionStore: Send + Sync + 'static {
    fn insert_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>>;

    fn get_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Compare-and-set status write.
    ///
    /// Applies `update` only if the current status is one of `from`, in a
    /// single atomic statement. Returns the updated row, or `None` when the
    /// row is missing or its status did not match.
    fn update_status(
        &self,
        id: &ExecutionId,
        from: &[ExecutionStatus],
        update: StatusUpdate,
    ) -> BoxFuture<'_, Result<Option<Execution>>>;

    /// Persist the state snapshot without touching status.
    fn save_state(&self, id: &ExecutionId, state: &Value) -> BoxFuture<'_, Result<()>>;

    fn append_log(&self, entry: &LogEntry) -> BoxFuture<'_, Result<()>>;

    /// Logs in insertion order, optionally filtered by level.
    fn list_logs(
        &self,
        id: &ExecutionId,
        level: Option<LogLevel>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<LogEntry>>>;

    fn append_span(&self, span: &TraceSpan) -> BoxFuture<'_, Result<()>>;

    fn list_spans(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Vec<TraceSpan>>>;

    fn save_flow(&self, flow: &FlowDefinition) -> BoxFuture<'_, Result<()>>;

    fn load_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    fn load_checkpoint(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    fn delete_checkpoint(&self, id: &ExecutionId) -> BoxFuture<'_, Result<()>>;
}

/// Event transport: cross-process pub/sub for execution events.
pub trait EventTransport: Send + Sync + 'static {
    /// Transport name (e.g., "local", "redis").
    fn name(&self) -> &str;

    fn publish(&self, envelope: TransportEnvelope) -> BoxFuture<'_, Result<()>>;

    /// Stream of every envelope published on the transport, including our own.
    fn subscribe(&self) -> BoxFuture<'_, Result<BoxStream<'static, TransportEnvelope>>>;
}
