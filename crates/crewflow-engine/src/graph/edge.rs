use serde_json::{Map, Value};
use tracing::warn;

use crewflow_core::error::ExprError;
use crewflow_core::flow::ConnectionType;

use crate::expr::Expr;

/// Position of a step in the graph arena.
pub type StepIdx = usize;

/// A compiled connection: endpoints resolved to arena indices, condition parsed.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: StepIdx,
    pub target: StepIdx,
    pub connection_type: ConnectionType,
    pub route_name: Option<String>,
    pub condition: Option<Condition>,
    pub label: Option<String>,
}

/// A condition as written plus its parse result.
///
/// Syntax errors are kept rather than rejected at load so they surface the
/// same way as evaluation errors: the edge is skipped and a warning logged.
#[derive(Debug, Clone)]
pub struct Condition {
    pub source: String,
    parsed: Result<Expr, ExprError>,
}

impl Condition {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let parsed = Expr::parse(&source);
        Self { source, parsed }
    }

    pub fn evaluate(&self, state: &Map<String, Value>) -> Result<bool, ExprError> {
        match &self.parsed {
            Ok(expr) => expr.evaluate_bool(state),
            Err(e) => Err(e.clone()),
        }
    }

    /// Truthy result, or `false` (with a warning) when evaluation fails.
    pub fn holds(&self, state: &Map<String, Value>, context: &str) -> bool {
        match self.evaluate(state) {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    condition = %self.source,
                    context = %context,
                    error = %e,
                    "Condition evaluation failed, treating as false"
                );
                false
            }
        }
    }

    pub fn parse_error(&self) -> Option<&ExprError> {
        self.parsed.as_ref().err()
    }
}

impl Edge {
    /// Whether this edge is followed out of its source.
    ///
    /// - route name and chosen route both set: follow iff they are equal;
    /// - otherwise a condition, if present, must hold;
    /// - otherwise always follow.
    pub fn is_taken(&self, state: &Map<String, Value>, chosen_route: Option<&str>) -> bool {
        if let (Some(route_name), Some(chosen)) = (self.route_name.as_deref(), chosen_route) {
            return route_name == chosen;
        }
        match &self.condition {
            Some(condition) => condition.holds(state, self.label.as_deref().unwrap_or("connection")),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(route_name: Option<&str>, condition: Option<&str>) -> Edge {
        Edge {
            source: 0,
            target: 1,
            connection_type: if condition.is_some() {
                ConnectionType::Conditional
            } else {
                ConnectionType::Normal
            },
            route_name: route_name.map(String::from),
            condition: condition.map(Condition::new),
            label: None,
        }
    }

    #[test]
    fn test_plain_edge_always_taken() {
        let state = Map::new();
        assert!(edge(None, None).is_taken(&state, None));
        assert!(edge(None, None).is_taken(&state, Some("high")));
    }

    #[test]
    fn test_route_name_matching() {
        let state = Map::new();
        let e = edge(Some("high"), None);
        assert!(e.is_taken(&state, Some("high")));
        assert!(!e.is_taken(&state, Some("low")));
        // No route chosen: the route name is ignored
        assert!(e.is_taken(&state, None));
    }

    #[test]
    fn test_route_name_wins_over_condition() {
        let state = json!({"x": 1}).as_object().cloned().unwrap();
        let e = edge(Some("high"), Some("x > 100"));
        assert!(e.is_taken(&state, Some("high")));
        assert!(!e.is_taken(&state, None));
    }

    #[test]
    fn test_condition_errors_skip_edge() {
        let state = json!({"x": "text"}).as_object().cloned().unwrap();
        assert!(!edge(None, Some("missing > 1")).is_taken(&state, None));
        assert!(!edge(None, Some("x > 1")).is_taken(&state, None));
        assert!(!edge(None, Some("x >")).is_taken(&state, None));
        assert!(edge(None, Some("x == 'text'")).is_taken(&state, None));
    }

    #[test]
    fn test_parse_error_is_retained() {
        let c = Condition::new("a ==");
        assert!(c.parse_error().is_some());
        assert!(Condition::new("a == 1").parse_error().is_none());
    }
}
