//! Flow execution engine: step graph, expressions, interpreter, execution
//! lifecycle and the worker pool that drives runs.

pub mod crew;
pub mod dispatcher;
pub mod executor;
pub mod expr;
pub mod functions;
pub mod graph;
pub mod interpreter;
pub mod lifecycle;
pub mod run_log;
pub mod runner;
pub mod service;

pub use crew::{crew_runner_from_config, HttpCrewRunner, UnconfiguredCrewRunner};
pub use dispatcher::{CancelRegistry, Job, JobDispatcher, JobHandle, JobHandler, JobKind};
pub use executor::{StepContext, StepExecutor, StepOutcome};
pub use expr::{evaluate_condition, Expr};
pub use functions::{FunctionRegistry, StepFunction};
pub use graph::{FlowGraph, FlowStep, StateStore};
pub use interpreter::{CancelCheck, FlowInterpreter, FlowOutcome, Traversal};
pub use lifecycle::ExecutionManager;
pub use run_log::ExecutionLogger;
pub use runner::ExecutionRunner;
pub use service::ExecutionService;
