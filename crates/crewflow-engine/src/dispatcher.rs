use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::ExecutionId;

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub execution_id: ExecutionId,
    pub kind: JobKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    RunFlow {
        flow_id: String,
        #[serde(default)]
        inputs: Map<String, Value>,
        #[serde(default)]
        initial_state: Map<String, Value>,
    },
    ResumeFlow {
        flow_id: String,
        feedback: Value,
    },
    RunCrew {
        crew_id: String,
        #[serde(default)]
        inputs: Map<String, Value>,
    },
}

/// Executes jobs taken off the queue.
pub trait JobHandler: Send + Sync + 'static {
    /// Run one job to completion. `cancel` fires when the job is cancelled.
    fn handle(&self, job: Job, cancel: CancellationToken) -> BoxFuture<'_, ()>;
}

/// Cancellation tokens of in-flight jobs, keyed by execution.
///
/// Shared between the dispatcher (which registers tokens) and the lifecycle
/// manager (which fires them on cancel).
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for an execution, created on first use.
    pub fn token(&self, id: &ExecutionId) -> CancellationToken {
        match self.tokens.lock() {
            Ok(mut tokens) => tokens.entry(id.clone()).or_default().clone(),
            Err(_) => CancellationToken::new(),
        }
    }

    /// Fire the token of an execution. Returns false if none is registered.
    pub fn cancel(&self, id: &ExecutionId) -> bool {
        let token = self.tokens.lock().ok().and_then(|t| t.get(id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn release(&self, id: &ExecutionId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(id);
        }
    }

    pub fn is_registered(&self, id: &ExecutionId) -> bool {
        self.tokens
            .lock()
            .map(|t| t.contains_key(id))
            .unwrap_or(false)
    }
}

/// Handle to a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub execution_id: ExecutionId,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct QueuedJob {
    job: Job,
    job_id: String,
    cancel: CancellationToken,
}

/// Bounded job queue drained by a fixed-size worker pool.
///
/// Each job runs on its own task; at most `pool_size` run at once.
/// Cancellation is cooperative: the job's token is fired and the handler
/// is expected to observe it between steps.
pub struct JobDispatcher {
    tx: mpsc::Sender<QueuedJob>,
    registry: Arc<CancelRegistry>,
}

impl JobDispatcher {
    /// Start the worker pool. It stops accepting work once `shutdown` fires.
    pub fn start(
        handler: Arc<dyn JobHandler>,
        registry: Arc<CancelRegistry>,
        pool_size: usize,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let workers = Arc::new(Semaphore::new(pool_size.max(1)));
        let task = tokio::spawn(Self::run(
            rx,
            handler,
            registry.clone(),
            workers,
            shutdown,
        ));
        (Self { tx, registry }, task)
    }

    async fn run(
        mut rx: mpsc::Receiver<QueuedJob>,
        handler: Arc<dyn JobHandler>,
        registry: Arc<CancelRegistry>,
        workers: Arc<Semaphore>,
        shutdown: CancellationToken,
    ) {
        info!(workers = workers.available_permits(), "Job dispatcher started");

        loop {
            let queued = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job dispatcher shutting down");
                    break;
                }
                queued = rx.recv() => match queued {
                    Some(q) => q,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let handler = handler.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                let QueuedJob {
                    job,
                    job_id,
                    cancel,
                } = queued;
                let execution_id = job.execution_id.clone();
                if cancel.is_cancelled() {
                    debug!(job_id = %job_id, execution_id = %execution_id, "Job cancelled before start");
                } else {
                    debug!(job_id = %job_id, execution_id = %execution_id, "Job started");
                }
                // The handler still runs a cancelled job so it can record the outcome
                handler.handle(job, cancel).await;
                registry.release(&execution_id);
                drop(permit);
                debug!(job_id = %job_id, execution_id = %execution_id, "Job finished");
            });
        }
    }

    /// Queue a job. Fails when the queue is full or the pool has stopped.
    pub fn submit(&self, job: Job) -> Result<JobHandle> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let execution_id = job.execution_id.clone();
        let cancel = self.registry.token(&execution_id);

        let queued = QueuedJob {
            job,
            job_id: job_id.clone(),
            cancel: cancel.clone(),
        };
        self.tx.try_send(queued).map_err(|e| {
            self.registry.release(&execution_id);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    CrewflowError::Dispatch("job queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    CrewflowError::Dispatch("job dispatcher has stopped".to_string())
                }
            }
        })?;

        debug!(job_id = %job_id, execution_id = %execution_id, "Job queued");
        Ok(JobHandle {
            job_id,
            execution_id,
            cancel,
        })
    }

    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel.cancel();
    }

    /// Cancel whatever job is running or queued for an execution.
    pub fn cancel_execution(&self, id: &ExecutionId) -> bool {
        let found = self.registry.cancel(id);
        if !found {
            warn!(execution_id = %id, "No active job to cancel");
        }
        found
    }

    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }
}
