use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key: output of the most recent crew step.
pub const CREW_RESULT_KEY: &str = "crew_result";
/// Reserved key: set by a human_feedback step, cleared on resume.
pub const AWAITING_FEEDBACK_KEY: &str = "awaiting_human_feedback";
/// Reserved key: the feedback submitted on resume.
pub const HUMAN_FEEDBACK_KEY: &str = "human_feedback";

/// Mutable key/value state threaded through one flow run.
///
/// Owned by the run; steps mutate it in place. Keys are strings, values JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateStore {
    data: Map<String, Value>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Build from a JSON value; anything other than an object yields an empty state.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(data) => Self { data },
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Merge a map into the state (overwrites on conflict).
    pub fn merge(&mut self, other: &Map<String, Value>) {
        for (k, v) in other {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn is_awaiting_feedback(&self) -> bool {
        self.get(AWAITING_FEEDBACK_KEY)
            .is_some_and(crate::expr::is_truthy)
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }
}
