pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CrewflowError, ExprError, GraphError, Result, StepError};
pub use event::{EventBroadcaster, EventPayload, ExecutionEvent, Subscription};
pub use flow::{Connection, ConnectionType, FlowDefinition, Step, StepType};
pub use types::*;
