use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crewflow_core::error::StepError;
use crewflow_core::event::{EventBroadcaster, EventPayload, ExecutionEvent};
use crewflow_core::traits::CrewRunner;
use crewflow_core::types::{ExecutionId, ExecutionMetrics, LogLevel};

use crate::functions::FunctionRegistry;
use crate::graph::state::{AWAITING_FEEDBACK_KEY, CREW_RESULT_KEY};
use crate::graph::{FlowStep, StateStore, StepAction};
use crate::interpreter::CancelCheck;
use crate::run_log::{ExecutionLogger, SourceType};

/// Result of one step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Route chosen by a router step.
    pub route: Option<String>,
    /// Usage reported by a crew step.
    pub metrics: Option<ExecutionMetrics>,
}

/// Per-run context handed to every step.
pub struct StepContext<'a> {
    pub execution_id: &'a ExecutionId,
    pub inputs: &'a Map<String, Value>,
    pub logger: &'a ExecutionLogger,
    /// Span of the enclosing flow run.
    pub parent_span: Option<&'a str>,
}

/// Executes a single step by type.
///
/// Emits `step_start` before and `step_complete` after the step's effect,
/// and records a log entry and a trace span for it. A step that finishes
/// after its run was cancelled gets no `step_complete`, so nothing follows
/// the final `cancelled` event.
pub struct StepExecutor {
    crew_runner: Arc<dyn CrewRunner>,
    functions: Arc<FunctionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
}

impl StepExecutor {
    pub fn new(
        crew_runner: Arc<dyn CrewRunner>,
        functions: Arc<FunctionRegistry>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            crew_runner,
            functions,
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub async fn execute(
        &self,
        ctx: &StepContext<'_>,
        step: &FlowStep,
        state: &mut StateStore,
        cancel: &CancelCheck,
    ) -> Result<StepOutcome, StepError> {
        let step_type = step.step_type.as_str();

        info!(execution_id = %ctx.execution_id, step = %step.name, step_type, "Executing step");
        ctx.logger
            .step(
                LogLevel::Info,
                &step.name,
                format!("Executing step: {} ({})", step.name, step_type),
            )
            .await;
        self.emit(
            ctx,
            EventPayload::StepStart {
                step_name: step.name.clone(),
                step_type: step_type.to_string(),
            },
        )
        .await;

        let span = ctx.logger.open_span(
            format!("step:{}", step.name),
            "step",
            ctx.parent_span,
            json!({ "step_id": step.id, "step_type": step_type }),
        );

        match self.apply(ctx, step, state, &span.span_id).await {
            Ok(outcome) => {
                ctx.logger.close_span(span, None).await;
                if cancel.is_cancelled(ctx.execution_id).await {
                    debug!(execution_id = %ctx.execution_id, step = %step.name, "Run cancelled during step");
                    return Ok(outcome);
                }
                self.emit(
                    ctx,
                    EventPayload::StepComplete {
                        step_name: step.name.clone(),
                        step_type: step_type.to_string(),
                    },
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                ctx.logger
                    .step(
                        LogLevel::Error,
                        &step.name,
                        format!("Step {} failed: {}", step.name, e),
                    )
                    .await;
                ctx.logger.close_span(span, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        ctx: &StepContext<'_>,
        step: &FlowStep,
        state: &mut StateStore,
        span_id: &str,
    ) -> Result<StepOutcome, StepError> {
        match &step.action {
            StepAction::Start => {
                state.merge(ctx.inputs);
                Ok(StepOutcome::default())
            }

            StepAction::End => Ok(StepOutcome::default()),

            StepAction::Listen { event } => {
                // Pass-through: flows continue without waiting for the event
                ctx.logger
                    .step(
                        LogLevel::Info,
                        &step.name,
                        format!(
                            "Listening for event: {}",
                            event.as_deref().unwrap_or("unspecified")
                        ),
                    )
                    .await;
                Ok(StepOutcome::default())
            }

            StepAction::Router(router) => {
                let route = router
                    .select(state.data(), &step.name)
                    .ok_or_else(|| StepError::NoRouteMatched {
                        step: step.name.clone(),
                    })?;
                debug!(execution_id = %ctx.execution_id, step = %step.name, route = %route, "Route selected");
                ctx.logger
                    .step(LogLevel::Info, &step.name, format!("Routing to: {}", route))
                    .await;
                Ok(StepOutcome {
                    route: Some(route),
                    metrics: None,
                })
            }

            StepAction::Crew { crew_id, crew_name } => {
                self.run_crew(ctx, step, state, span_id, crew_id, crew_name.as_deref())
                    .await
            }

            StepAction::Function {
                function_name,
                assign,
            } => {
                let mut working = state.data().clone();

                if let Some(name) = function_name {
                    let function =
                        self.functions
                            .get(name)
                            .ok_or_else(|| StepError::UnknownFunction {
                                step: step.name.clone(),
                                function: name.clone(),
                            })?;
                    let partial = function
                        .call(working.clone(), step.config.clone())
                        .await
                        .map_err(|e| StepError::Function {
                            step: step.name.clone(),
                            message: e.to_string(),
                        })?;
                    working.extend(partial);
                }

                for (key, expr) in assign {
                    let value = expr.evaluate(&working).map_err(|e| StepError::Function {
                        step: step.name.clone(),
                        message: format!("assign {}: {}", key, e),
                    })?;
                    working.insert(key.clone(), value);
                }

                // Only a fully successful function step touches the state
                *state = StateStore::from_map(working);
                Ok(StepOutcome::default())
            }

            // The input request itself is published by the runner once the
            // execution is `waiting_human`.
            StepAction::HumanFeedback { prompt, .. } => {
                ctx.logger
                    .step(
                        LogLevel::Info,
                        &step.name,
                        format!("Requesting human feedback: {}", prompt),
                    )
                    .await;
                state.set(AWAITING_FEEDBACK_KEY, Value::Bool(true));
                Ok(StepOutcome::default())
            }
        }
    }

    async fn run_crew(
        &self,
        ctx: &StepContext<'_>,
        step: &FlowStep,
        state: &mut StateStore,
        span_id: &str,
        crew_id: &str,
        crew_name: Option<&str>,
    ) -> Result<StepOutcome, StepError> {
        ctx.logger
            .log(
                LogLevel::Info,
                format!("Executing crew: {}", crew_name.unwrap_or(crew_id)),
                Some(&step.name),
                SourceType::Crew,
                Some(json!({ "crew_id": crew_id })),
            )
            .await;

        let span = ctx.logger.open_span(
            format!("crew:{}", crew_id),
            "crew_call",
            Some(span_id),
            json!({ "crew_id": crew_id }),
        );

        match self
            .crew_runner
            .run_crew(crew_id, state.data().clone())
            .await
        {
            Ok(output) => {
                ctx.logger.close_span(span, None).await;
                state.set(CREW_RESULT_KEY, output.outputs);
                Ok(StepOutcome {
                    route: None,
                    metrics: Some(output.metrics),
                })
            }
            Err(e) => {
                ctx.logger.close_span(span, Some(e.to_string())).await;
                Err(StepError::Crew {
                    step: step.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn emit(&self, ctx: &StepContext<'_>, payload: EventPayload) {
        self.broadcaster
            .publish(ExecutionEvent::new(ctx.execution_id.clone(), payload))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_core::flow::{Step, StepType};
    use crewflow_core::traits::ExecutionStore;
    use crewflow_core::types::{CrewOutput, SpanStatus};
    use crewflow_test_utils::{drain_events, MemoryStore, MockCrewRunner};

    struct Harness {
        store: Arc<MemoryStore>,
        crew: Arc<MockCrewRunner>,
        broadcaster: Arc<EventBroadcaster>,
        executor: StepExecutor,
        id: ExecutionId,
        logger: ExecutionLogger,
    }

    fn harness(functions: FunctionRegistry) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let crew = Arc::new(MockCrewRunner::new());
        let broadcaster = Arc::new(EventBroadcaster::local(64));
        let executor = StepExecutor::new(crew.clone(), Arc::new(functions), broadcaster.clone());
        let id = ExecutionId::new();
        let logger = ExecutionLogger::new(store.clone(), id.clone());
        Harness {
            store,
            crew,
            broadcaster,
            executor,
            id,
            logger,
        }
    }

    fn compile(step_type: StepType, config: Value) -> FlowStep {
        let mut step = Step::new("s", step_type);
        step.name = "the-step".into();
        step.config = config.as_object().cloned().unwrap_or_default();
        FlowStep::compile(&step).unwrap()
    }

    impl Harness {
        async fn run(
            &self,
            step: &FlowStep,
            state: &mut StateStore,
            inputs: &Map<String, Value>,
        ) -> Result<StepOutcome, StepError> {
            let ctx = StepContext {
                execution_id: &self.id,
                inputs,
                logger: &self.logger,
                parent_span: None,
            };
            self.executor
                .execute(&ctx, step, state, &CancelCheck::never())
                .await
        }
    }

    #[tokio::test]
    async fn test_start_merges_inputs_and_emits_events() {
        let h = harness(FunctionRegistry::new());
        let mut sub = h.broadcaster.subscribe(&h.id);
        let mut state = StateStore::from_value(json!({"keep": 1, "topic": "old"}));
        let inputs = json!({"topic": "rust"}).as_object().cloned().unwrap();

        h.run(&compile(StepType::Start, json!({})), &mut state, &inputs)
            .await
            .unwrap();

        assert_eq!(state.get_str("topic"), Some("rust"));
        assert_eq!(state.get("keep"), Some(&json!(1)));
        let types: Vec<_> = drain_events(&mut sub).iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["step_start", "step_complete"]);

        let spans = h.store.list_spans(&h.id).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].operation_name, "step:the-step");
    }

    #[tokio::test]
    async fn test_crew_result_and_metrics() {
        let h = harness(FunctionRegistry::new());
        h.crew.respond_with(
            "c1",
            CrewOutput {
                outputs: json!({"summary": "done"}),
                metrics: ExecutionMetrics {
                    total_tokens: 12,
                    ..Default::default()
                },
            },
        );
        let mut state = StateStore::from_value(json!({"topic": "rust"}));

        let outcome = h
            .run(&compile(StepType::Crew, json!({"crew_id": "c1"})), &mut state, &Map::new())
            .await
            .unwrap();

        assert_eq!(state.get(CREW_RESULT_KEY), Some(&json!({"summary": "done"})));
        assert_eq!(outcome.metrics.unwrap().total_tokens, 12);
        let calls = h.crew.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "c1");
        assert_eq!(calls[0].1.get("topic"), Some(&json!("rust")));

        let spans = h.store.list_spans(&h.id).await.unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].operation_type.as_deref(), Some("crew_call"));
        assert_eq!(spans[0].parent_span_id.as_deref(), Some(spans[1].span_id.as_str()));
    }

    #[tokio::test]
    async fn test_crew_failure_is_step_error() {
        let h = harness(FunctionRegistry::new());
        h.crew.fail_with("c1", "model overloaded");
        let mut sub = h.broadcaster.subscribe(&h.id);
        let mut state = StateStore::new();

        let err = h
            .run(&compile(StepType::Crew, json!({"crew_id": "c1"})), &mut state, &Map::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Crew { ref message, .. } if message.contains("model overloaded")));
        let types: Vec<_> = drain_events(&mut sub).iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["step_start"]);
        let spans = h.store.list_spans(&h.id).await.unwrap();
        assert!(spans.iter().all(|s| s.status == SpanStatus::Error));
        let errors = h
            .store
            .list_logs(&h.id, Some(LogLevel::Error), 10)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_function_and_assign() {
        let mut functions = FunctionRegistry::new();
        functions.register_fn("score", |state, config| {
            let base = config.get("base").and_then(Value::as_i64).unwrap_or(0);
            let len = state.get("text").and_then(Value::as_str).map_or(0, str::len) as i64;
            let mut out = Map::new();
            out.insert("score".into(), json!(base + len));
            Ok(out)
        });
        let h = harness(functions);
        let step = compile(
            StepType::Function,
            json!({
                "function_name": "score",
                "base": 10,
                "assign": [{"key": "passed", "expr": "score > 12"}]
            }),
        );
        let mut state = StateStore::from_value(json!({"text": "abc"}));

        h.run(&step, &mut state, &Map::new()).await.unwrap();

        assert_eq!(state.get("score"), Some(&json!(13)));
        assert_eq!(state.get("passed"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_function_errors_leave_state_untouched() {
        let h = harness(FunctionRegistry::new());
        let mut state = StateStore::from_value(json!({"n": 1}));

        let err = h
            .run(
                &compile(StepType::Function, json!({"function_name": "nope"})),
                &mut state,
                &Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnknownFunction { ref function, .. } if function == "nope"));

        let err = h
            .run(
                &compile(
                    StepType::Function,
                    json!({"assign": [{"key": "a", "expr": "2"}, {"key": "b", "expr": "n / 0"}]}),
                ),
                &mut state,
                &Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Function { .. }));
        assert_eq!(state, StateStore::from_value(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_router_outcome() {
        let h = harness(FunctionRegistry::new());
        let step = compile(
            StepType::Router,
            json!({"conditions": [{"condition": "x > 5", "route": "high"}], "routes": ["high", "low"]}),
        );
        let mut state = StateStore::from_value(json!({"x": 7}));
        let outcome = h.run(&step, &mut state, &Map::new()).await.unwrap();
        assert_eq!(outcome.route.as_deref(), Some("high"));

        let mut state = StateStore::from_value(json!({"x": 1}));
        let outcome = h.run(&step, &mut state, &Map::new()).await.unwrap();
        assert_eq!(outcome.route.as_deref(), Some("low"));

        let bare = compile(StepType::Router, json!({"conditions": [{"condition": "x > 5", "route": "high"}]}));
        let err = h.run(&bare, &mut state, &Map::new()).await.unwrap_err();
        assert!(matches!(err, StepError::NoRouteMatched { .. }));
    }

    #[tokio::test]
    async fn test_human_feedback_sets_flag_without_prompting() {
        let h = harness(FunctionRegistry::new());
        let mut sub = h.broadcaster.subscribe(&h.id);
        let step = compile(
            StepType::HumanFeedback,
            json!({"prompt": "Approve?", "options": ["yes", "no"]}),
        );
        let mut state = StateStore::new();

        h.run(&step, &mut state, &Map::new()).await.unwrap();

        assert!(state.is_awaiting_feedback());
        let types: Vec<_> = drain_events(&mut sub)
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["step_start", "step_complete"]);
        let logs = h.store.list_logs(&h.id, None, 10).await.unwrap();
        assert!(logs
            .iter()
            .any(|l| l.message == "Requesting human feedback: Approve?"));
    }

    #[tokio::test]
    async fn test_no_step_complete_after_cancellation() {
        let h = harness(FunctionRegistry::new());
        let mut sub = h.broadcaster.subscribe(&h.id);
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let inputs = json!({"topic": "rust"}).as_object().cloned().unwrap();
        let ctx = StepContext {
            execution_id: &h.id,
            inputs: &inputs,
            logger: &h.logger,
            parent_span: None,
        };
        let mut state = StateStore::new();

        h.executor
            .execute(
                &ctx,
                &compile(StepType::Start, json!({})),
                &mut state,
                &CancelCheck::new(token, None),
            )
            .await
            .unwrap();

        // The step's effect stands; only the completion event is withheld
        assert_eq!(state.get_str("topic"), Some("rust"));
        let types: Vec<_> = drain_events(&mut sub)
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["step_start"]);
    }

    #[tokio::test]
    async fn test_listen_is_pass_through() {
        let h = harness(FunctionRegistry::new());
        let mut state = StateStore::from_value(json!({"a": 1}));
        let outcome = h
            .run(&compile(StepType::Listen, json!({"event": "order.created"})), &mut state, &Map::new())
            .await
            .unwrap();
        assert!(outcome.route.is_none());
        assert_eq!(state, StateStore::from_value(json!({"a": 1})));

        let logs = h.store.list_logs(&h.id, None, 10).await.unwrap();
        assert!(logs.iter().any(|l| l.message == "Listening for event: order.created"));
    }
}
