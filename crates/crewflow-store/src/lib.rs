//! SQLite persistence for executions, logs, trace spans, flows and checkpoints.

mod store;

pub use store::SqliteStore;
