use thiserror::Error;

use crate::types::ExecutionStatus;

#[derive(Debug, Error)]
pub enum CrewflowError {
    // Flow definition errors
    #[error("Invalid flow graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    // Run errors
    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Expression error: {0}")]
    Expr(#[from] ExprError),

    // Lifecycle errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Execution {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: ExecutionStatus,
        expected: ExecutionStatus,
    },

    #[error("Cannot cancel execution {id} with status {status}")]
    CannotCancel { id: String, status: ExecutionStatus },

    #[error("No suspension checkpoint for execution {0}")]
    CheckpointNotFound(String),

    // Crew capability errors
    #[error("Crew execution failed: {0}")]
    CrewExecution(String),

    // Dispatch errors
    #[error("Job dispatcher error: {0}")]
    Dispatch(String),

    // Event transport errors
    #[error("Event transport error: {0}")]
    Transport(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed flow definitions. Detected at load time; the run never starts.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("flow has no start step")]
    NoStartStep,

    #[error("flow has more than one start step: {0:?}")]
    MultipleStartSteps(Vec<String>),

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("connection references unknown step: {0}")]
    UnknownStep(String),

    #[error("connection {source_step} -> {target} targets the start step")]
    ConnectionTargetsStart { source_step: String, target: String },

    #[error("conditional connection {source_step} -> {target} has no condition")]
    MissingCondition { source_step: String, target: String },

    #[error("steps unreachable from start: {0:?}")]
    UnreachableSteps(Vec<String>),

    #[error("no end step is reachable from start")]
    NoReachableEnd,

    #[error("step {step} has invalid config: {reason}")]
    InvalidStepConfig { step: String, reason: String },
}

/// A step's effect failed. Fatal to the run, never retried by the interpreter.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("Step {step}: crew execution failed: {message}")]
    Crew { step: String, message: String },

    #[error("Step {step}: function failed: {message}")]
    Function { step: String, message: String },

    #[error("Step {step}: unknown function '{function}'")]
    UnknownFunction { step: String, function: String },

    #[error("Step {step}: no route matched and no default route configured")]
    NoRouteMatched { step: String },

    #[error("Step {step}: {message}")]
    Other { step: String, message: String },
}

impl StepError {
    /// Name of the step that raised the error.
    pub fn step(&self) -> &str {
        match self {
            Self::Crew { step, .. }
            | Self::Function { step, .. }
            | Self::UnknownFunction { step, .. }
            | Self::NoRouteMatched { step }
            | Self::Other { step, .. } => step,
        }
    }
}

/// Failure to parse or evaluate a condition/assignment expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown function: {0}")]
    UnknownFunction(String),
}

pub type Result<T> = std::result::Result<T, CrewflowError>;
