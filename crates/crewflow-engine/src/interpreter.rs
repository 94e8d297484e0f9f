use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crewflow_core::error::StepError;
use crewflow_core::types::{ExecutionId, ExecutionMetrics};

use crate::executor::{StepContext, StepExecutor};
use crate::graph::state::{AWAITING_FEEDBACK_KEY, HUMAN_FEEDBACK_KEY};
use crate::graph::{FlowGraph, StateStore, StepIdx};
use crate::lifecycle::ExecutionManager;

/// Position of a flow run, serializable into a checkpoint.
///
/// Steps are referenced by id so a checkpoint stays readable on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Traversal {
    /// Steps left to run in the current level.
    pub frontier: VecDeque<String>,
    /// Successors collected for the next level.
    pub next: Vec<String>,
    pub visits: HashMap<String, u32>,
    pub suspended_at: Option<String>,
    pub steps_executed: u64,
    pub metrics: ExecutionMetrics,
    /// Run time accumulated before the last suspension.
    pub elapsed_ms: u64,
}

impl Traversal {
    fn starting_at(step_id: &str) -> Self {
        Self {
            frontier: VecDeque::from([step_id.to_string()]),
            ..Default::default()
        }
    }

    fn push_successors(
        &mut self,
        graph: &FlowGraph,
        current: StepIdx,
        state: &StateStore,
        route: Option<&str>,
    ) {
        for idx in graph.next_steps(current, state.data(), route) {
            if let Some(step) = graph.step(idx) {
                if !self.next.contains(&step.id) {
                    self.next.push(step.id.clone());
                }
            }
        }
    }

    /// Move the collected successors into the frontier, ordered by
    /// `(order, declaration index)`.
    fn advance(&mut self, graph: &FlowGraph) {
        let mut level: Vec<(i64, StepIdx, String)> = self
            .next
            .drain(..)
            .filter_map(|id| {
                let idx = graph.index_of(&id)?;
                let order = graph.step(idx)?.order;
                Some((order, idx, id))
            })
            .collect();
        level.sort_by_key(|(order, idx, _)| (*order, *idx));
        self.frontier = level.into_iter().map(|(_, _, id)| id).collect();
    }
}

/// How a run (or run segment) ended.
#[derive(Debug)]
pub enum FlowOutcome {
    Completed {
        outputs: Value,
        metrics: ExecutionMetrics,
        state: StateStore,
    },
    /// Paused on a `human_feedback` step.
    Suspended {
        step_id: String,
        traversal: Traversal,
        state: StateStore,
    },
    Failed {
        error: StepError,
        state: StateStore,
        steps_executed: u64,
    },
    Cancelled {
        state: StateStore,
    },
}

/// Cooperative cancellation check, run before every step.
///
/// A run stops when its dispatcher token fires or when the persisted status
/// has been set to `cancelled` by another node.
#[derive(Clone, Default)]
pub struct CancelCheck {
    token: CancellationToken,
    manager: Option<Arc<ExecutionManager>>,
}

impl CancelCheck {
    pub fn new(token: CancellationToken, manager: Option<Arc<ExecutionManager>>) -> Self {
        Self { token, manager }
    }

    /// Never cancels.
    pub fn never() -> Self {
        Self::default()
    }

    pub async fn is_cancelled(&self, id: &ExecutionId) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match &self.manager {
            Some(manager) => match manager.is_cancelled(id).await {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "Cancellation check failed");
                    false
                }
            },
            None => false,
        }
    }
}

/// Breadth-first step graph interpreter.
///
/// Each level runs sequentially in step order; successors are collected
/// into the next level. A step runs at most `max_visits` times per
/// execution, which bounds cycles.
pub struct FlowInterpreter {
    executor: Arc<StepExecutor>,
}

impl FlowInterpreter {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }

    /// Run a flow from its start step.
    pub async fn run(
        &self,
        graph: &FlowGraph,
        ctx: &StepContext<'_>,
        state: StateStore,
        cancel: &CancelCheck,
    ) -> FlowOutcome {
        let start = match graph.find_start_step() {
            Ok(step) => step.id.clone(),
            Err(e) => {
                return FlowOutcome::Failed {
                    error: StepError::Other {
                        step: String::new(),
                        message: e.to_string(),
                    },
                    state,
                    steps_executed: 0,
                }
            }
        };
        info!(execution_id = %ctx.execution_id, flow = %graph.name, "Flow run started");
        self.drive(graph, ctx, state, Traversal::starting_at(&start), cancel)
            .await
    }

    /// Continue a suspended run with the human's answer.
    ///
    /// The answer is stored under `human_feedback` before the successors of
    /// the suspended step are evaluated, so their conditions can read it.
    pub async fn resume(
        &self,
        graph: &FlowGraph,
        ctx: &StepContext<'_>,
        mut state: StateStore,
        mut traversal: Traversal,
        feedback: Value,
        cancel: &CancelCheck,
    ) -> FlowOutcome {
        state.remove(AWAITING_FEEDBACK_KEY);
        state.set(HUMAN_FEEDBACK_KEY, feedback);

        let suspended = traversal.suspended_at.take().unwrap_or_default();
        let Some(idx) = graph.index_of(&suspended) else {
            return FlowOutcome::Failed {
                error: StepError::Other {
                    step: suspended,
                    message: "suspended step is not part of the flow".to_string(),
                },
                steps_executed: traversal.steps_executed,
                state,
            };
        };

        info!(execution_id = %ctx.execution_id, step = %suspended, "Flow run resumed");
        traversal.push_successors(graph, idx, &state, None);
        self.drive(graph, ctx, state, traversal, cancel).await
    }

    async fn drive(
        &self,
        graph: &FlowGraph,
        ctx: &StepContext<'_>,
        mut state: StateStore,
        mut trav: Traversal,
        cancel: &CancelCheck,
    ) -> FlowOutcome {
        let started = Instant::now();

        loop {
            while let Some(step_id) = trav.frontier.pop_front() {
                let found = graph
                    .index_of(&step_id)
                    .and_then(|idx| graph.step(idx).map(|step| (idx, step)));
                let Some((idx, step)) = found else {
                    return FlowOutcome::Failed {
                        error: StepError::Other {
                            step: step_id,
                            message: "step is not part of the flow".to_string(),
                        },
                        steps_executed: trav.steps_executed,
                        state,
                    };
                };

                let visits = trav.visits.get(&step_id).copied().unwrap_or(0);
                if visits >= step.max_visits {
                    debug!(execution_id = %ctx.execution_id, step = %step.name, visits, "Visit limit reached, skipping");
                    continue;
                }

                if cancel.is_cancelled(ctx.execution_id).await {
                    info!(execution_id = %ctx.execution_id, step = %step.name, "Flow run cancelled");
                    return FlowOutcome::Cancelled { state };
                }

                trav.visits.insert(step_id.clone(), visits + 1);
                let outcome = match self
                    .executor
                    .execute(ctx, step, &mut state, cancel)
                    .await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        return FlowOutcome::Failed {
                            error,
                            steps_executed: trav.steps_executed,
                            state,
                        }
                    }
                };

                trav.steps_executed += 1;
                if let Some(metrics) = &outcome.metrics {
                    trav.metrics.absorb(metrics);
                }

                if state.is_awaiting_feedback() {
                    trav.suspended_at = Some(step_id.clone());
                    trav.elapsed_ms += started.elapsed().as_millis() as u64;
                    info!(execution_id = %ctx.execution_id, step = %step.name, "Flow run waiting for human feedback");
                    return FlowOutcome::Suspended {
                        step_id,
                        traversal: trav,
                        state,
                    };
                }

                trav.push_successors(graph, idx, &state, outcome.route.as_deref());
            }

            if trav.next.is_empty() {
                break;
            }
            trav.advance(graph);
        }

        let duration_ms = trav.elapsed_ms + started.elapsed().as_millis() as u64;
        let mut metrics = trav.metrics;
        metrics.duration_ms = Some(duration_ms);

        info!(
            execution_id = %ctx.execution_id,
            steps = trav.steps_executed,
            duration_ms,
            "Flow run completed"
        );
        FlowOutcome::Completed {
            outputs: json!({
                "state": state.to_value(),
                "steps_executed": trav.steps_executed,
                "duration_ms": duration_ms,
            }),
            metrics,
            state,
        }
    }
}
