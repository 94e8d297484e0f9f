//! Step graph: validated flow definitions and the state threaded through a run.
//!
//! A flow is a directed graph of typed steps joined by connections. Steps are
//! compiled once at load (type-specific config extracted, expressions parsed)
//! and held in an arena; connections become edges indexed by source step.

pub mod edge;
pub mod flow;
pub mod state;
pub mod step;

pub use edge::{Condition, Edge, StepIdx};
pub use flow::FlowGraph;
pub use state::StateStore;
pub use step::{FlowStep, RouterConfig, StepAction};
