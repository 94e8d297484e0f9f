use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crewflow_core::config::WorkerConfig;
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::event::{EventBroadcaster, Subscription};
use crewflow_core::flow::FlowDefinition;
use crewflow_core::traits::{CrewRunner, ExecutionStore};
use crewflow_core::types::{
    Execution, ExecutionId, ExecutionKind, LogEntry, LogLevel, TraceSpan,
};

use crate::dispatcher::{CancelRegistry, Job, JobDispatcher, JobKind};
use crate::executor::StepExecutor;
use crate::functions::FunctionRegistry;
use crate::graph::FlowGraph;
use crate::lifecycle::ExecutionManager;
use crate::runner::ExecutionRunner;

/// Entry point for clients: kick off, observe, cancel and answer runs.
///
/// Asynchronous runs go through the job dispatcher; synchronous runs execute
/// on the caller's task and return the finished execution.
pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    manager: Arc<ExecutionManager>,
    broadcaster: Arc<EventBroadcaster>,
    runner: Arc<ExecutionRunner>,
    dispatcher: JobDispatcher,
}

impl ExecutionService {
    /// Wire the engine together and start the worker pool.
    pub fn start(
        store: Arc<dyn ExecutionStore>,
        broadcaster: Arc<EventBroadcaster>,
        crew_runner: Arc<dyn CrewRunner>,
        functions: FunctionRegistry,
        worker: &WorkerConfig,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let cancels = Arc::new(CancelRegistry::new());
        let manager = Arc::new(ExecutionManager::new(
            store.clone(),
            broadcaster.clone(),
            cancels.clone(),
        ));
        let executor = Arc::new(StepExecutor::new(
            crew_runner.clone(),
            Arc::new(functions),
            broadcaster.clone(),
        ));
        let runner = Arc::new(ExecutionRunner::new(
            manager.clone(),
            broadcaster.clone(),
            crew_runner,
            executor,
        ));
        let (dispatcher, task) = JobDispatcher::start(
            runner.clone(),
            cancels,
            worker.pool_size,
            worker.queue_capacity,
            shutdown,
        );

        (
            Self {
                store,
                manager,
                broadcaster,
                runner,
                dispatcher,
            },
            task,
        )
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    /// Validate and store a flow definition.
    pub async fn save_flow(&self, definition: &FlowDefinition) -> Result<FlowGraph> {
        let graph = FlowGraph::build(definition)?;
        self.store.save_flow(definition).await?;
        info!(flow_id = %definition.id, steps = graph.steps_count(), "Flow saved");
        Ok(graph)
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<FlowDefinition> {
        self.store
            .load_flow(flow_id)
            .await?
            .ok_or_else(|| CrewflowError::FlowNotFound(flow_id.to_string()))
    }

    pub async fn kickoff_flow(
        &self,
        flow_id: &str,
        inputs: Map<String, Value>,
        initial_state: Map<String, Value>,
        async_execution: bool,
        trigger_type: &str,
    ) -> Result<Execution> {
        self.get_flow(flow_id).await?;
        let execution = self
            .manager
            .create(ExecutionKind::Flow, flow_id, inputs.clone(), trigger_type)
            .await?;
        let job = Job {
            execution_id: execution.id.clone(),
            kind: JobKind::RunFlow {
                flow_id: flow_id.to_string(),
                inputs,
                initial_state,
            },
        };
        self.launch(execution, job, async_execution).await
    }

    pub async fn kickoff_crew(
        &self,
        crew_id: &str,
        inputs: Map<String, Value>,
        async_execution: bool,
        trigger_type: &str,
    ) -> Result<Execution> {
        let execution = self
            .manager
            .create(ExecutionKind::Crew, crew_id, inputs.clone(), trigger_type)
            .await?;
        let job = Job {
            execution_id: execution.id.clone(),
            kind: JobKind::RunCrew {
                crew_id: crew_id.to_string(),
                inputs,
            },
        };
        self.launch(execution, job, async_execution).await
    }

    pub async fn cancel(&self, id: &ExecutionId) -> Result<Execution> {
        self.manager.cancel(id).await
    }

    /// Accept feedback for a suspended flow and schedule its continuation.
    pub async fn submit_feedback(&self, id: &ExecutionId, feedback: Value) -> Result<Execution> {
        let execution = self.manager.submit_feedback(id, &feedback).await?;
        let job = Job {
            execution_id: id.clone(),
            kind: JobKind::ResumeFlow {
                flow_id: execution.target_id.clone(),
                feedback,
            },
        };
        if let Err(e) = self.dispatcher.submit(job) {
            warn!(execution_id = %id, error = %e, "Could not schedule resumed run");
            self.manager.fail(id, &e.to_string(), None, None).await?;
            return Err(e);
        }
        Ok(execution)
    }

    pub async fn get(&self, id: &ExecutionId) -> Result<Execution> {
        self.manager.get(id).await
    }

    pub async fn logs(
        &self,
        id: &ExecutionId,
        level: Option<LogLevel>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        self.manager.get(id).await?;
        self.store.list_logs(id, level, limit).await
    }

    pub async fn traces(&self, id: &ExecutionId) -> Result<Vec<TraceSpan>> {
        self.manager.get(id).await?;
        self.store.list_spans(id).await
    }

    pub fn subscribe(&self, id: &ExecutionId) -> Subscription {
        self.broadcaster.subscribe(id)
    }

    async fn launch(&self, execution: Execution, job: Job, async_execution: bool) -> Result<Execution> {
        let id = execution.id.clone();
        if async_execution {
            if let Err(e) = self.dispatcher.submit(job) {
                self.manager.fail(&id, &e.to_string(), None, None).await?;
                return Err(e);
            }
            return Ok(execution);
        }

        let registry = self.dispatcher.registry();
        let token = registry.token(&id);
        self.runner.execute(job, token).await;
        registry.release(&id);
        self.manager.get(&id).await
    }
}
