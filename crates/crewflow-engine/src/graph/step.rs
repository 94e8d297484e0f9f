use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crewflow_core::error::GraphError;
use crewflow_core::flow::{Step, StepType};

use super::edge::Condition;
use crate::expr::Expr;

pub const DEFAULT_FEEDBACK_PROMPT: &str = "Please provide feedback";

/// A validated step, ready to execute.
#[derive(Debug, Clone)]
pub struct FlowStep {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    pub order: i64,
    /// Visits allowed per execution (at least 1).
    pub max_visits: u32,
    pub config: Map<String, Value>,
    pub action: StepAction,
}

/// Type-specific behavior, extracted from the step config at load time.
#[derive(Debug, Clone)]
pub enum StepAction {
    Start,
    End,
    Listen {
        event: Option<String>,
    },
    Router(RouterConfig),
    Crew {
        crew_id: String,
        crew_name: Option<String>,
    },
    Function {
        function_name: Option<String>,
        assign: Vec<(String, Expr)>,
    },
    HumanFeedback {
        prompt: String,
        options: Vec<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct RouteCondition {
    pub condition: Condition,
    pub route: String,
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub conditions: Vec<RouteCondition>,
    pub routes: Vec<String>,
    pub default_route: Option<String>,
}

impl RouterConfig {
    /// First route whose condition holds, else the default route, else the
    /// last declared route. `None` when there is nothing to fall back to.
    pub fn select(&self, state: &Map<String, Value>, step_name: &str) -> Option<String> {
        for entry in &self.conditions {
            if entry.condition.holds(state, step_name) {
                return Some(entry.route.clone());
            }
        }
        self.default_route
            .clone()
            .or_else(|| self.routes.last().cloned())
    }
}

#[derive(Deserialize)]
struct RawCondition {
    condition: String,
    #[serde(default)]
    route: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAssign {
    Map(Map<String, Value>),
    List(Vec<RawAssignEntry>),
}

#[derive(Deserialize)]
struct RawAssignEntry {
    key: String,
    expr: String,
}

impl FlowStep {
    pub fn compile(step: &Step) -> Result<Self, GraphError> {
        let invalid = |reason: String| GraphError::InvalidStepConfig {
            step: step.id.clone(),
            reason,
        };

        let action = match step.step_type {
            StepType::Start => StepAction::Start,
            StepType::End => StepAction::End,
            StepType::Listen => StepAction::Listen {
                event: step.config_str("event").map(String::from),
            },
            StepType::Crew => {
                let crew_id = step
                    .crew_id()
                    .ok_or_else(|| invalid("crew step requires a crew_id".to_string()))?;
                StepAction::Crew {
                    crew_id: crew_id.to_string(),
                    crew_name: step.config_str("crew_name").map(String::from),
                }
            }
            StepType::Function => {
                let function_name = step.config_str("function_name").map(String::from);
                let assign = match step.config.get("assign") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(raw) => compile_assign(raw).map_err(invalid)?,
                };
                if function_name.is_none() && assign.is_empty() {
                    return Err(invalid(
                        "function step requires a function_name or assign expressions".to_string(),
                    ));
                }
                StepAction::Function {
                    function_name,
                    assign,
                }
            }
            StepType::Router => StepAction::Router(compile_router(step).map_err(invalid)?),
            StepType::HumanFeedback => StepAction::HumanFeedback {
                prompt: step
                    .config_str("prompt")
                    .unwrap_or(DEFAULT_FEEDBACK_PROMPT)
                    .to_string(),
                options: match step.config.get("options") {
                    Some(Value::Array(options)) => options.clone(),
                    None | Some(Value::Null) => Vec::new(),
                    Some(_) => return Err(invalid("options must be a list".to_string())),
                },
            },
        };

        Ok(Self {
            id: step.id.clone(),
            name: step.name.clone(),
            step_type: step.step_type,
            order: step.order,
            max_visits: step.max_visits.unwrap_or(1).max(1),
            config: step.config.clone(),
            action,
        })
    }
}

fn compile_router(step: &Step) -> Result<RouterConfig, String> {
    let routes: Vec<String> = match step.config.get("routes") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("routes must be a list of names: {}", e))?,
    };
    let raw: Vec<RawCondition> = match step.config.get("conditions") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("conditions must be a list of {{condition, route}}: {}", e))?,
    };

    let mut conditions = Vec::with_capacity(raw.len());
    for (i, entry) in raw.into_iter().enumerate() {
        // An entry without its own route takes the route at the same position
        let route = entry
            .route
            .or_else(|| routes.get(i).cloned())
            .ok_or_else(|| format!("condition #{} has no route", i))?;
        let condition = Condition::new(entry.condition);
        if let Some(e) = condition.parse_error() {
            warn!(step = %step.id, route = %route, error = %e, "Router condition does not parse; it will never match");
        }
        conditions.push(RouteCondition { condition, route });
    }

    Ok(RouterConfig {
        conditions,
        routes,
        default_route: step.config_str("default_route").map(String::from),
    })
}

fn compile_assign(raw: &Value) -> Result<Vec<(String, Expr)>, String> {
    let raw: RawAssign = serde_json::from_value(raw.clone()).map_err(|_| {
        "assign must be a map of key to expression or a list of {key, expr}".to_string()
    })?;

    let pairs: Vec<(String, String)> = match raw {
        RawAssign::Map(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                other => Err(format!("assign.{} must be an expression string, got {}", k, other)),
            })
            .collect::<Result<_, _>>()?,
        RawAssign::List(entries) => entries.into_iter().map(|e| (e.key, e.expr)).collect(),
    };

    pairs
        .into_iter()
        .map(|(key, src)| {
            Expr::parse(&src)
                .map(|expr| (key.clone(), expr))
                .map_err(|e| format!("assign.{}: {}", key, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(step_type: StepType, config: Value) -> Step {
        let mut s = Step::new("s1", step_type);
        s.config = config.as_object().cloned().unwrap_or_default();
        s
    }

    #[test]
    fn test_crew_requires_id() {
        let err = FlowStep::compile(&step(StepType::Crew, json!({}))).unwrap_err();
        assert!(matches!(err, GraphError::InvalidStepConfig { .. }));

        let compiled = FlowStep::compile(&step(StepType::Crew, json!({"crew_id": "c1"}))).unwrap();
        assert!(matches!(compiled.action, StepAction::Crew { ref crew_id, .. } if crew_id == "c1"));
    }

    #[test]
    fn test_human_feedback_defaults() {
        let compiled = FlowStep::compile(&step(StepType::HumanFeedback, json!({}))).unwrap();
        match compiled.action {
            StepAction::HumanFeedback { prompt, options } => {
                assert_eq!(prompt, DEFAULT_FEEDBACK_PROMPT);
                assert!(options.is_empty());
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(compiled.max_visits, 1);
    }

    #[test]
    fn test_router_selection() {
        let compiled = FlowStep::compile(&step(
            StepType::Router,
            json!({
                "conditions": [
                    {"condition": "score > 80", "route": "high"},
                    {"condition": "score > 50", "route": "medium"}
                ],
                "routes": ["high", "medium", "low"]
            }),
        ))
        .unwrap();
        let StepAction::Router(router) = compiled.action else {
            panic!("expected router");
        };

        let at = |score: i64| json!({ "score": score }).as_object().cloned().unwrap();
        assert_eq!(router.select(&at(90), "r").as_deref(), Some("high"));
        assert_eq!(router.select(&at(60), "r").as_deref(), Some("medium"));
        assert_eq!(router.select(&at(10), "r").as_deref(), Some("low"));
        // Evaluation error counts as no match
        assert_eq!(router.select(&Map::new(), "r").as_deref(), Some("low"));
    }

    #[test]
    fn test_router_default_route_and_positional_routes() {
        let compiled = FlowStep::compile(&step(
            StepType::Router,
            json!({
                "conditions": [{"condition": "flag"}],
                "routes": ["yes", "no"],
                "default_route": "fallback"
            }),
        ))
        .unwrap();
        let StepAction::Router(router) = compiled.action else {
            panic!("expected router");
        };
        assert_eq!(router.conditions[0].route, "yes");
        let off = json!({"flag": false}).as_object().cloned().unwrap();
        assert_eq!(router.select(&off, "r").as_deref(), Some("fallback"));
    }

    #[test]
    fn test_router_without_fallback() {
        let compiled = FlowStep::compile(&step(
            StepType::Router,
            json!({"conditions": [{"condition": "x", "route": "a"}]}),
        ))
        .unwrap();
        let StepAction::Router(router) = compiled.action else {
            panic!("expected router");
        };
        assert_eq!(router.select(&Map::new(), "r"), None);
    }

    #[test]
    fn test_function_assign_forms() {
        let compiled = FlowStep::compile(&step(
            StepType::Function,
            json!({"assign": [{"key": "a", "expr": "1"}, {"key": "b", "expr": "a + 1"}]}),
        ))
        .unwrap();
        match compiled.action {
            StepAction::Function { function_name, assign } => {
                assert!(function_name.is_none());
                let keys: Vec<_> = assign.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["a", "b"]);
            }
            other => panic!("unexpected action {:?}", other),
        }

        assert!(FlowStep::compile(&step(StepType::Function, json!({"assign": {"x": "1 +"}}))).is_err());
        assert!(FlowStep::compile(&step(StepType::Function, json!({"assign": {"x": 5}}))).is_err());
        assert!(FlowStep::compile(&step(StepType::Function, json!({}))).is_err());
    }

    #[test]
    fn test_max_visits_floor() {
        let mut s = step(StepType::End, json!({}));
        s.max_visits = Some(0);
        assert_eq!(FlowStep::compile(&s).unwrap().max_visits, 1);
        s.max_visits = Some(3);
        assert_eq!(FlowStep::compile(&s).unwrap().max_visits, 3);
    }
}
