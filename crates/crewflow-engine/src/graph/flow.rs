use std::collections::{HashMap, VecDeque};

use serde_json::{Map, Value};
use tracing::warn;

use crewflow_core::error::GraphError;
use crewflow_core::flow::{ConnectionType, FlowDefinition, StepType};

use super::edge::{Condition, Edge, StepIdx};
use super::step::FlowStep;

/// An immutable, validated flow.
///
/// Steps live in an arena indexed by declaration position; `outgoing[i]`
/// lists the edges leaving step `i` in declaration order.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub persistence_enabled: bool,
    steps: Vec<FlowStep>,
    index: HashMap<String, StepIdx>,
    outgoing: Vec<Vec<Edge>>,
    start: StepIdx,
}

impl FlowGraph {
    /// Validate a definition and build the adjacency structure.
    pub fn build(def: &FlowDefinition) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(def.steps.len());
        for (i, step) in def.steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }

        let starts: Vec<&str> = def
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Start)
            .map(|s| s.id.as_str())
            .collect();
        let start = match starts.as_slice() {
            [] => return Err(GraphError::NoStartStep),
            [only] => index[*only],
            many => {
                return Err(GraphError::MultipleStartSteps(
                    many.iter().map(|s| s.to_string()).collect(),
                ))
            }
        };

        let steps = def
            .steps
            .iter()
            .map(FlowStep::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let mut outgoing: Vec<Vec<Edge>> = vec![Vec::new(); steps.len()];
        for conn in &def.connections {
            let source = *index
                .get(&conn.source_step_id)
                .ok_or_else(|| GraphError::UnknownStep(conn.source_step_id.clone()))?;
            let target = *index
                .get(&conn.target_step_id)
                .ok_or_else(|| GraphError::UnknownStep(conn.target_step_id.clone()))?;

            if target == start {
                return Err(GraphError::ConnectionTargetsStart {
                    source_step: conn.source_step_id.clone(),
                    target: conn.target_step_id.clone(),
                });
            }

            let condition = conn
                .condition
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(Condition::new);
            if conn.connection_type == ConnectionType::Conditional && condition.is_none() {
                return Err(GraphError::MissingCondition {
                    source_step: conn.source_step_id.clone(),
                    target: conn.target_step_id.clone(),
                });
            }
            if let Some(e) = condition.as_ref().and_then(Condition::parse_error) {
                warn!(
                    source_step = %conn.source_step_id,
                    target = %conn.target_step_id,
                    error = %e,
                    "Connection condition does not parse; the connection will never be taken"
                );
            }

            outgoing[source].push(Edge {
                source,
                target,
                connection_type: conn.connection_type,
                route_name: conn.route_name.clone(),
                condition,
                label: conn.label.clone(),
            });
        }

        let graph = Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            persistence_enabled: def.persistence_enabled,
            steps,
            index,
            outgoing,
            start,
        };
        graph.check_reachability()?;
        Ok(graph)
    }

    fn check_reachability(&self) -> Result<(), GraphError> {
        let mut seen = vec![false; self.steps.len()];
        let mut queue = VecDeque::from([self.start]);
        seen[self.start] = true;
        while let Some(idx) = queue.pop_front() {
            for edge in &self.outgoing[idx] {
                if !seen[edge.target] {
                    seen[edge.target] = true;
                    queue.push_back(edge.target);
                }
            }
        }

        let unreachable: Vec<String> = self
            .steps
            .iter()
            .zip(&seen)
            .filter(|(_, seen)| !**seen)
            .map(|(step, _)| step.id.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(GraphError::UnreachableSteps(unreachable));
        }

        if !self.steps.iter().any(|s| s.step_type == StepType::End) {
            return Err(GraphError::NoReachableEnd);
        }
        Ok(())
    }

    /// The unique start step.
    pub fn find_start_step(&self) -> Result<&FlowStep, GraphError> {
        self.steps.get(self.start).ok_or(GraphError::NoStartStep)
    }

    pub fn start_index(&self) -> StepIdx {
        self.start
    }

    pub fn step(&self, idx: StepIdx) -> Option<&FlowStep> {
        self.steps.get(idx)
    }

    pub fn index_of(&self, id: &str) -> Option<StepIdx> {
        self.index.get(id).copied()
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    pub fn steps_count(&self) -> usize {
        self.steps.len()
    }

    pub fn outgoing(&self, idx: StepIdx) -> &[Edge] {
        self.outgoing.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Successors of `current` for the given state and chosen route.
    ///
    /// Edges are considered in declaration order; the result holds each
    /// target once. Condition errors skip the edge.
    pub fn next_steps(
        &self,
        current: StepIdx,
        state: &Map<String, Value>,
        chosen_route: Option<&str>,
    ) -> Vec<StepIdx> {
        let mut next = Vec::new();
        for edge in self.outgoing(current) {
            if edge.is_taken(state, chosen_route) && !next.contains(&edge.target) {
                next.push(edge.target);
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_core::flow::{Connection, Step};
    use serde_json::json;

    fn def(steps: Vec<Step>, connections: Vec<Connection>) -> FlowDefinition {
        FlowDefinition {
            id: "f".into(),
            name: "test flow".into(),
            description: None,
            persistence_enabled: false,
            steps,
            connections,
        }
    }

    fn linear() -> FlowDefinition {
        def(
            vec![
                Step::new("start", StepType::Start),
                Step::new("end", StepType::End),
            ],
            vec![Connection::new("start", "end")],
        )
    }

    #[test]
    fn test_build_linear() {
        let graph = FlowGraph::build(&linear()).unwrap();
        assert_eq!(graph.find_start_step().unwrap().id, "start");
        assert_eq!(graph.steps_count(), 2);
        assert_eq!(graph.next_steps(0, &Map::new(), None), vec![1]);
        assert!(graph.next_steps(1, &Map::new(), None).is_empty());
    }

    #[test]
    fn test_no_start() {
        let d = def(vec![Step::new("end", StepType::End)], vec![]);
        assert_eq!(FlowGraph::build(&d).unwrap_err(), GraphError::NoStartStep);
    }

    #[test]
    fn test_multiple_starts() {
        let d = def(
            vec![
                Step::new("a", StepType::Start),
                Step::new("b", StepType::Start),
                Step::new("end", StepType::End),
            ],
            vec![],
        );
        assert_eq!(
            FlowGraph::build(&d).unwrap_err(),
            GraphError::MultipleStartSteps(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_duplicate_and_unknown_steps() {
        let mut d = linear();
        d.steps.push(Step::new("end", StepType::End));
        assert_eq!(
            FlowGraph::build(&d).unwrap_err(),
            GraphError::DuplicateStep("end".into())
        );

        let mut d = linear();
        d.connections.push(Connection::new("start", "ghost"));
        assert_eq!(
            FlowGraph::build(&d).unwrap_err(),
            GraphError::UnknownStep("ghost".into())
        );
    }

    #[test]
    fn test_connection_into_start_rejected() {
        let mut d = linear();
        d.connections.push(Connection::new("end", "start"));
        assert!(matches!(
            FlowGraph::build(&d).unwrap_err(),
            GraphError::ConnectionTargetsStart { .. }
        ));
    }

    #[test]
    fn test_conditional_requires_condition() {
        let mut d = linear();
        d.connections[0].connection_type = ConnectionType::Conditional;
        assert!(matches!(
            FlowGraph::build(&d).unwrap_err(),
            GraphError::MissingCondition { .. }
        ));
    }

    #[test]
    fn test_unreachable_and_missing_end() {
        let mut d = linear();
        d.steps.push(Step::new("orphan", StepType::End));
        assert_eq!(
            FlowGraph::build(&d).unwrap_err(),
            GraphError::UnreachableSteps(vec!["orphan".into()])
        );

        let d = def(
            vec![
                Step::new("start", StepType::Start),
                Step::new("wait", StepType::Listen),
            ],
            vec![Connection::new("start", "wait")],
        );
        assert_eq!(FlowGraph::build(&d).unwrap_err(), GraphError::NoReachableEnd);
    }

    #[test]
    fn test_next_steps_conditions_and_dedup() {
        let d = def(
            vec![
                Step::new("start", StepType::Start),
                Step::new("high", StepType::End),
                Step::new("low", StepType::End),
            ],
            vec![
                Connection::new("start", "high").when("x > 5"),
                Connection::new("start", "low").when("x <= 5"),
                Connection::new("start", "high"),
            ],
        );
        let graph = FlowGraph::build(&d).unwrap();
        let hi = graph.index_of("high").unwrap();
        let lo = graph.index_of("low").unwrap();

        let state = json!({"x": 10}).as_object().cloned().unwrap();
        assert_eq!(graph.next_steps(0, &state, None), vec![hi]);

        let state = json!({"x": 1}).as_object().cloned().unwrap();
        assert_eq!(graph.next_steps(0, &state, None), vec![lo, hi]);

        // Missing field: both conditional edges skipped, plain edge kept
        assert_eq!(graph.next_steps(0, &Map::new(), None), vec![hi]);
    }

    #[test]
    fn test_next_steps_route_names() {
        let d = def(
            vec![
                Step::new("start", StepType::Start),
                Step::new("a", StepType::End),
                Step::new("b", StepType::End),
            ],
            vec![
                Connection::new("start", "a").route("left"),
                Connection::new("start", "b").route("right"),
            ],
        );
        let graph = FlowGraph::build(&d).unwrap();
        assert_eq!(graph.next_steps(0, &Map::new(), Some("right")), vec![2]);
        assert_eq!(graph.next_steps(0, &Map::new(), None), vec![1, 2]);
    }
}
