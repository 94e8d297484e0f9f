use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::error;

use crewflow_core::traits::ExecutionStore;
use crewflow_core::types::{ExecutionId, LogEntry, LogLevel, SpanStatus, TraceSpan};

/// Where a log entry originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    System,
    Step,
    Crew,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Step => "step",
            Self::Crew => "crew",
        }
    }
}

/// Persistent execution logger.
///
/// Appends log entries and trace spans for one execution through the store.
/// Write failures are reported via `tracing` and never fail the run.
#[derive(Clone)]
pub struct ExecutionLogger {
    store: Arc<dyn ExecutionStore>,
    execution_id: ExecutionId,
}

/// A span that has started but not yet been written.
#[derive(Debug, Clone)]
pub struct OpenSpan {
    pub span_id: String,
    parent_span_id: Option<String>,
    operation_name: String,
    operation_type: String,
    start_time: DateTime<Utc>,
    started: Instant,
    attributes: Value,
}

impl ExecutionLogger {
    pub fn new(store: Arc<dyn ExecutionStore>, execution_id: ExecutionId) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        source: Option<&str>,
        source_type: SourceType,
        data: Option<Value>,
    ) {
        let entry = LogEntry {
            execution_id: self.execution_id.clone(),
            level,
            message: message.into(),
            source: source.map(String::from),
            source_type: Some(source_type.as_str().to_string()),
            data,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&entry).await {
            error!(execution_id = %self.execution_id, error = %e, "Failed to write execution log");
        }
    }

    pub async fn system(&self, level: LogLevel, message: impl Into<String>) {
        self.log(level, message, None, SourceType::System, None).await;
    }

    pub async fn step(&self, level: LogLevel, step_name: &str, message: impl Into<String>) {
        self.log(level, message, Some(step_name), SourceType::Step, None)
            .await;
    }

    /// Start timing an operation. The trace id is the execution id.
    pub fn open_span(
        &self,
        operation_name: impl Into<String>,
        operation_type: &str,
        parent_span_id: Option<&str>,
        attributes: Value,
    ) -> OpenSpan {
        OpenSpan {
            span_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
            parent_span_id: parent_span_id.map(String::from),
            operation_name: operation_name.into(),
            operation_type: operation_type.to_string(),
            start_time: Utc::now(),
            started: Instant::now(),
            attributes,
        }
    }

    /// Close and persist a span. `error` marks it failed.
    pub async fn close_span(&self, span: OpenSpan, error: Option<String>) {
        let record = TraceSpan {
            execution_id: self.execution_id.clone(),
            trace_id: self.execution_id.0.clone(),
            span_id: span.span_id,
            parent_span_id: span.parent_span_id,
            operation_name: span.operation_name,
            operation_type: Some(span.operation_type),
            start_time: span.start_time,
            end_time: Some(Utc::now()),
            duration_ms: Some(span.started.elapsed().as_millis() as u64),
            status: if error.is_some() {
                SpanStatus::Error
            } else {
                SpanStatus::Ok
            },
            error,
            attributes: span.attributes,
        };
        if let Err(e) = self.store.append_span(&record).await {
            error!(execution_id = %self.execution_id, error = %e, "Failed to write trace span");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_test_utils::MemoryStore;

    #[tokio::test]
    async fn test_log_entries_are_appended() {
        let store = Arc::new(MemoryStore::new());
        let id = ExecutionId::new();
        let logger = ExecutionLogger::new(store.clone(), id.clone());

        logger.system(LogLevel::Info, "Flow execution started").await;
        logger.step(LogLevel::Error, "fetch", "Step fetch failed").await;

        let logs = store.list_logs(&id, None, 100).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].source_type.as_deref(), Some("system"));
        assert_eq!(logs[1].source.as_deref(), Some("fetch"));
        assert_eq!(logs[1].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_span_parenting_and_status() {
        let store = Arc::new(MemoryStore::new());
        let id = ExecutionId::new();
        let logger = ExecutionLogger::new(store.clone(), id.clone());

        let root = logger.open_span("flow", "flow", None, Value::Null);
        let child = logger.open_span("step:a", "step", Some(&root.span_id), Value::Null);
        let root_id = root.span_id.clone();
        logger.close_span(child, Some("boom".into())).await;
        logger.close_span(root, None).await;

        let spans = store.list_spans(&id).await.unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].parent_span_id.as_deref(), Some(root_id.as_str()));
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(spans[0].trace_id, id.0);
        assert_eq!(spans[1].status, SpanStatus::Ok);
        assert!(spans[1].end_time.is_some());
    }
}
