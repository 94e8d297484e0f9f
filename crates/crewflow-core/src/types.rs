use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Crew,
    Flow,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crew => "crew",
            Self::Flow => "flow",
        }
    }
}

impl FromStr for ExecutionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crew" => Ok(Self::Crew),
            "flow" => Ok(Self::Flow),
            other => Err(format!("unknown execution kind: {other}")),
        }
    }
}

/// Execution status state machine.
///
/// ```text
/// Pending -> Running -> Completed | Failed | Cancelled
///            Running <-> WaitingHuman
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingHuman,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses from which `next` may be entered.
    pub fn sources_of(next: ExecutionStatus) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match next {
            Pending => &[],
            Running => &[Pending, WaitingHuman],
            WaitingHuman => &[Running],
            Completed => &[Running],
            Failed => &[Pending, Running],
            Cancelled => &[Pending, Running],
        }
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        Self::sources_of(next).contains(self)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_human" => Ok(Self::WaitingHuman),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Token and cost accounting for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub estimated_cost: f64,
}

impl ExecutionMetrics {
    /// Add another run's token usage and cost (duration is left untouched).
    pub fn absorb(&mut self, other: &ExecutionMetrics) {
        self.total_tokens += other.total_tokens;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.estimated_cost += other.estimated_cost;
    }
}

/// One invocation of a flow or crew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    /// Flow id or crew id, depending on `kind`.
    pub target_id: String,
    pub status: ExecutionStatus,
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub trigger_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
}

impl Execution {
    pub fn new(
        kind: ExecutionKind,
        target_id: impl Into<String>,
        inputs: Map<String, Value>,
        trigger_type: impl Into<String>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            kind,
            target_id: target_id.into(),
            status: ExecutionStatus::Pending,
            inputs,
            state: None,
            outputs: None,
            error: None,
            trigger_type: trigger_type.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metrics: ExecutionMetrics::default(),
        }
    }
}

/// Fields written together with a status transition.
///
/// Timestamps are stamped by the store: entering `running` sets `started_at`
/// when unset, entering a terminal status sets `completed_at`.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub outputs: Option<Value>,
    pub state: Option<Value>,
    pub metrics: Option<ExecutionMetrics>,
}

impl StatusUpdate {
    pub fn to(status: ExecutionStatus) -> Self {
        Self {
            status,
            error: None,
            outputs: None,
            state: None,
            metrics: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Append-only execution log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: ExecutionId,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// Append-only trace span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub execution_id: ExecutionId,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    #[serde(default)]
    pub operation_type: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attributes: Value,
}

/// Output of the external crew capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrewOutput {
    pub outputs: Value,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
}

/// Durable snapshot of a suspended flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub flow_id: String,
    pub state: Value,
    /// Serialized interpreter traversal position.
    pub traversal: Value,
    pub created_at: DateTime<Utc>,
}
