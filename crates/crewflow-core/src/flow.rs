use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Persisted flow definition, as submitted by clients.
///
/// Validation happens when the definition is compiled into a graph by the
/// engine; this type only describes the wire/storage shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub persistence_enabled: bool,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    Listen,
    Router,
    Crew,
    Function,
    HumanFeedback,
    End,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Listen => "listen",
            Self::Router => "router",
            Self::Crew => "crew",
            Self::Function => "function",
            Self::HumanFeedback => "human_feedback",
            Self::End => "end",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub crew_id: Option<String>,
    /// Execution order among steps reached in the same traversal level.
    #[serde(default)]
    pub order: i64,
    /// How many times the step may run in one execution. Defaults to once.
    #[serde(default)]
    pub max_visits: Option<u32>,
}

impl Step {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            config: Map::new(),
            crew_id: None,
            order: 0,
            max_visits: None,
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Crew to run for a crew step: the step's own `crew_id`, else `config.crew_id`.
    pub fn crew_id(&self) -> Option<&str> {
        self.crew_id.as_deref().or_else(|| self.config_str("crew_id"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Normal,
    Or,
    And,
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(rename = "type", default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub route_name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_step_id: source.into(),
            target_step_id: target.into(),
            connection_type: ConnectionType::Normal,
            condition: None,
            route_name: None,
            label: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.connection_type = ConnectionType::Conditional;
        self.condition = Some(condition.into());
        self
    }

    pub fn route(mut self, route_name: impl Into<String>) -> Self {
        self.route_name = Some(route_name.into());
        self
    }
}
