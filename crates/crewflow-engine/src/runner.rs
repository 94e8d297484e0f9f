use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::event::{EventBroadcaster, EventPayload, ExecutionEvent};
use crewflow_core::traits::{CrewRunner, ExecutionStore};
use crewflow_core::types::{Checkpoint, ExecutionId, ExecutionMetrics, ExecutionStatus, LogLevel};

use crate::dispatcher::{Job, JobHandler, JobKind};
use crate::executor::{StepContext, StepExecutor};
use crate::graph::{FlowGraph, StateStore, StepAction};
use crate::interpreter::{CancelCheck, FlowInterpreter, FlowOutcome, Traversal};
use crate::lifecycle::ExecutionManager;
use crate::run_log::{ExecutionLogger, OpenSpan};

/// Runs jobs end to end: status transitions, events, logs and the flow
/// interpreter. Every failure is absorbed here and recorded as a `failed`
/// execution with one `error` event.
pub struct ExecutionRunner {
    store: Arc<dyn ExecutionStore>,
    manager: Arc<ExecutionManager>,
    broadcaster: Arc<EventBroadcaster>,
    crew_runner: Arc<dyn CrewRunner>,
    interpreter: FlowInterpreter,
}

impl ExecutionRunner {
    pub fn new(
        manager: Arc<ExecutionManager>,
        broadcaster: Arc<EventBroadcaster>,
        crew_runner: Arc<dyn CrewRunner>,
        executor: Arc<StepExecutor>,
    ) -> Self {
        Self {
            store: manager.store().clone(),
            manager,
            broadcaster,
            crew_runner,
            interpreter: FlowInterpreter::new(executor),
        }
    }

    /// Run a job to completion on the current task.
    pub async fn execute(&self, job: Job, cancel: CancellationToken) {
        let id = job.execution_id.clone();
        let result = match job.kind {
            JobKind::RunFlow {
                flow_id,
                inputs,
                initial_state,
            } => {
                self.run_flow(&id, &flow_id, inputs, initial_state, cancel)
                    .await
            }
            JobKind::ResumeFlow { flow_id, feedback } => {
                self.resume_flow(&id, &flow_id, feedback, cancel).await
            }
            JobKind::RunCrew { crew_id, inputs } => {
                self.run_crew(&id, &crew_id, inputs, cancel).await
            }
        };

        if let Err(e) = result {
            error!(execution_id = %id, error = %e, "Job failed");
            let logger = ExecutionLogger::new(self.store.clone(), id.clone());
            self.fail_run(&id, &logger, "Execution failed", &e.to_string(), None)
                .await;
        }
    }

    async fn run_flow(
        &self,
        id: &ExecutionId,
        flow_id: &str,
        inputs: Map<String, Value>,
        initial_state: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !self.begin(id).await? {
            return Ok(());
        }
        let logger = ExecutionLogger::new(self.store.clone(), id.clone());

        logger.system(LogLevel::Info, "Flow execution started").await;
        self.emit(
            id,
            EventPayload::Start {
                message: "Flow execution started".to_string(),
                inputs: Value::Object(inputs.clone()),
            },
        )
        .await;

        let graph = match self.load_graph(flow_id).await {
            Ok(graph) => graph,
            Err(e) => {
                self.fail_run(id, &logger, "Flow execution failed", &e.to_string(), None)
                    .await;
                return Ok(());
            }
        };

        self.emit(
            id,
            EventPayload::FlowLoaded {
                flow_name: graph.name.clone(),
                steps_count: graph.steps_count(),
            },
        )
        .await;

        let span = logger.open_span(
            format!("flow:{}", graph.name),
            "flow",
            None,
            json!({ "flow_id": graph.id }),
        );
        let cancel = CancelCheck::new(cancel, Some(self.manager.clone()));
        let ctx = StepContext {
            execution_id: id,
            inputs: &inputs,
            logger: &logger,
            parent_span: Some(&span.span_id),
        };
        let outcome = self
            .interpreter
            .run(&graph, &ctx, StateStore::from_map(initial_state), &cancel)
            .await;

        self.finish_flow(id, &graph, &logger, span, outcome).await
    }

    async fn resume_flow(
        &self,
        id: &ExecutionId,
        flow_id: &str,
        feedback: Value,
        cancel: CancellationToken,
    ) -> Result<()> {
        let execution = self.manager.get(id).await?;
        if execution.status != ExecutionStatus::Running {
            warn!(execution_id = %id, status = %execution.status, "Resume skipped, execution is not running");
            return Ok(());
        }
        let logger = ExecutionLogger::new(self.store.clone(), id.clone());

        let checkpoint = self
            .store
            .load_checkpoint(id)
            .await?
            .ok_or_else(|| CrewflowError::CheckpointNotFound(id.to_string()))?;
        let graph = match self.load_graph(flow_id).await {
            Ok(graph) => graph,
            Err(e) => {
                self.fail_run(id, &logger, "Flow execution failed", &e.to_string(), None)
                    .await;
                return Ok(());
            }
        };
        let traversal: Traversal = serde_json::from_value(checkpoint.traversal)?;
        self.store.delete_checkpoint(id).await?;

        logger.system(LogLevel::Info, "Flow execution resumed").await;

        let span = logger.open_span(
            format!("flow:{}", graph.name),
            "flow",
            None,
            json!({ "flow_id": graph.id, "resumed": true }),
        );
        let cancel = CancelCheck::new(cancel, Some(self.manager.clone()));
        let ctx = StepContext {
            execution_id: id,
            inputs: &execution.inputs,
            logger: &logger,
            parent_span: Some(&span.span_id),
        };
        let outcome = self
            .interpreter
            .resume(
                &graph,
                &ctx,
                StateStore::from_value(checkpoint.state),
                traversal,
                feedback,
                &cancel,
            )
            .await;

        self.finish_flow(id, &graph, &logger, span, outcome).await
    }

    async fn run_crew(
        &self,
        id: &ExecutionId,
        crew_id: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !self.begin(id).await? {
            return Ok(());
        }
        let logger = ExecutionLogger::new(self.store.clone(), id.clone());
        let started = Instant::now();

        logger.system(LogLevel::Info, "Crew execution started").await;
        self.emit(
            id,
            EventPayload::Start {
                message: "Crew execution started".to_string(),
                inputs: Value::Object(inputs.clone()),
            },
        )
        .await;

        if cancel.is_cancelled() {
            self.settle_cancelled(id, None).await;
            return Ok(());
        }

        let span = logger.open_span(
            format!("crew:{}", crew_id),
            "crew_call",
            None,
            json!({ "crew_id": crew_id }),
        );
        match self.crew_runner.run_crew(crew_id, inputs).await {
            Ok(output) => {
                logger.close_span(span, None).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                let mut metrics = output.metrics;
                metrics.duration_ms = Some(duration_ms);
                self.complete_run(
                    id,
                    &logger,
                    output.outputs,
                    None,
                    metrics,
                    format!("Crew execution completed in {}ms", duration_ms),
                )
                .await;
            }
            Err(e) => {
                logger.close_span(span, Some(e.to_string())).await;
                self.fail_run(id, &logger, "Crew execution failed", &e.to_string(), None)
                    .await;
            }
        }
        Ok(())
    }

    /// `pending -> running`. Returns false when the run must not proceed.
    async fn begin(&self, id: &ExecutionId) -> Result<bool> {
        match self.manager.start(id).await {
            Ok(_) => Ok(true),
            Err(CrewflowError::InvalidTransition { from, .. }) => {
                info!(execution_id = %id, status = %from, "Execution not started");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_graph(&self, flow_id: &str) -> Result<FlowGraph> {
        let definition = self
            .store
            .load_flow(flow_id)
            .await?
            .ok_or_else(|| CrewflowError::FlowNotFound(flow_id.to_string()))?;
        Ok(FlowGraph::build(&definition)?)
    }

    async fn finish_flow(
        &self,
        id: &ExecutionId,
        graph: &FlowGraph,
        logger: &ExecutionLogger,
        span: OpenSpan,
        outcome: FlowOutcome,
    ) -> Result<()> {
        match outcome {
            FlowOutcome::Completed {
                outputs,
                metrics,
                state,
            } => {
                logger.close_span(span, None).await;
                let message = format!(
                    "Flow execution completed in {}ms",
                    metrics.duration_ms.unwrap_or(0)
                );
                self.complete_run(id, logger, outputs, kept_state(graph, &state), metrics, message)
                    .await;
            }

            FlowOutcome::Suspended {
                step_id,
                traversal,
                state,
            } => {
                logger.close_span(span, None).await;
                let checkpoint = Checkpoint {
                    execution_id: id.clone(),
                    flow_id: graph.id.clone(),
                    state: state.to_value(),
                    traversal: serde_json::to_value(&traversal)?,
                    created_at: Utc::now(),
                };
                // Checkpoint first: feedback is only accepted once the status flips
                self.store.save_checkpoint(&checkpoint).await?;
                match self.manager.suspend(id, kept_state(graph, &state)).await {
                    Ok(_) => {
                        logger
                            .system(
                                LogLevel::Info,
                                format!("Waiting for human feedback at step: {}", step_id),
                            )
                            .await;
                        // Observers may answer as soon as they see this
                        self.request_input(id, graph, &step_id).await;
                    }
                    Err(e) => {
                        warn!(execution_id = %id, error = %e, "Could not suspend execution");
                        self.store.delete_checkpoint(id).await?;
                    }
                }
            }

            FlowOutcome::Failed { error, state, .. } => {
                logger.close_span(span, Some(error.to_string())).await;
                self.fail_run(
                    id,
                    logger,
                    "Flow execution failed",
                    &error.to_string(),
                    kept_state(graph, &state),
                )
                .await;
            }

            FlowOutcome::Cancelled { state } => {
                logger.close_span(span, Some("cancelled".to_string())).await;
                logger.system(LogLevel::Warning, "Flow execution cancelled").await;
                self.settle_cancelled(id, kept_state(graph, &state)).await;
            }
        }
        Ok(())
    }

    async fn request_input(&self, id: &ExecutionId, graph: &FlowGraph, step_id: &str) {
        let Some(step) = graph.index_of(step_id).and_then(|idx| graph.step(idx)) else {
            warn!(execution_id = %id, step = %step_id, "Suspended on unknown step");
            return;
        };
        if let StepAction::HumanFeedback { prompt, options } = &step.action {
            self.emit(
                id,
                EventPayload::HumanInputRequired {
                    step_name: step.name.clone(),
                    prompt: prompt.clone(),
                    options: options.clone(),
                },
            )
            .await;
        }
    }

    async fn complete_run(
        &self,
        id: &ExecutionId,
        logger: &ExecutionLogger,
        outputs: Value,
        state: Option<Value>,
        metrics: ExecutionMetrics,
        message: String,
    ) {
        match self
            .manager
            .complete(id, outputs.clone(), state, metrics.clone())
            .await
        {
            Ok(_) => {
                logger.system(LogLevel::Info, message.clone()).await;
                self.emit(
                    id,
                    EventPayload::Complete {
                        output: outputs,
                        metrics,
                        message,
                    },
                )
                .await;
            }
            Err(e) => warn!(execution_id = %id, error = %e, "Could not record completion"),
        }
    }

    async fn fail_run(
        &self,
        id: &ExecutionId,
        logger: &ExecutionLogger,
        context: &str,
        error: &str,
        state: Option<Value>,
    ) {
        let message = format!("{}: {}", context, error);
        match self.manager.fail(id, error, state, None).await {
            Ok(_) => {
                logger.system(LogLevel::Error, message.clone()).await;
                self.emit(
                    id,
                    EventPayload::Error {
                        message,
                        error: error.to_string(),
                    },
                )
                .await;
            }
            Err(e) => warn!(execution_id = %id, error = %e, "Could not record failure"),
        }
    }

    /// Record a cancellation observed by the run. When the token fired
    /// without the status changing, the status is set here.
    async fn settle_cancelled(&self, id: &ExecutionId, state: Option<Value>) {
        if let Some(state) = &state {
            if let Err(e) = self.store.save_state(id, state).await {
                warn!(execution_id = %id, error = %e, "Could not save state of cancelled run");
            }
        }
        match self.manager.is_cancelled(id).await {
            Ok(true) => {}
            _ => {
                if let Err(e) = self.manager.cancel(id).await {
                    warn!(execution_id = %id, error = %e, "Could not record cancellation");
                }
            }
        }
    }

    async fn emit(&self, id: &ExecutionId, payload: EventPayload) {
        self.broadcaster
            .publish(ExecutionEvent::new(id.clone(), payload))
            .await;
    }
}

/// Flow state is written to the execution row only for flows with
/// persistence enabled. Suspended runs always keep it in their checkpoint.
fn kept_state(graph: &FlowGraph, state: &StateStore) -> Option<Value> {
    graph.persistence_enabled.then(|| state.to_value())
}

impl JobHandler for ExecutionRunner {
    fn handle(&self, job: Job, cancel: CancellationToken) -> BoxFuture<'_, ()> {
        Box::pin(self.execute(job, cancel))
    }
}
