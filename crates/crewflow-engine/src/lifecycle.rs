use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::event::{EventBroadcaster, EventPayload, ExecutionEvent};
use crewflow_core::traits::ExecutionStore;
use crewflow_core::types::{
    Execution, ExecutionId, ExecutionKind, ExecutionMetrics, ExecutionStatus, StatusUpdate,
};

use crate::dispatcher::CancelRegistry;

/// Sole writer of execution status.
///
/// Every transition is a compare-and-set against the statuses it may start
/// from, so concurrent writers (a worker finishing a run, a client
/// cancelling it) cannot both succeed.
pub struct ExecutionManager {
    store: Arc<dyn ExecutionStore>,
    broadcaster: Arc<EventBroadcaster>,
    cancels: Arc<CancelRegistry>,
}

impl ExecutionManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        broadcaster: Arc<EventBroadcaster>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            cancels,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub async fn create(
        &self,
        kind: ExecutionKind,
        target_id: &str,
        inputs: Map<String, Value>,
        trigger_type: &str,
    ) -> Result<Execution> {
        let execution = Execution::new(kind, target_id, inputs, trigger_type);
        self.store.insert_execution(&execution).await?;
        info!(
            execution_id = %execution.id,
            kind = execution.kind.as_str(),
            target = %execution.target_id,
            "Execution created"
        );
        Ok(execution)
    }

    pub async fn get(&self, id: &ExecutionId) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| CrewflowError::ExecutionNotFound(id.to_string()))
    }

    pub async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatus> {
        Ok(self.get(id).await?.status)
    }

    /// Whether the persisted status is `cancelled`. Missing rows count as cancelled.
    pub async fn is_cancelled(&self, id: &ExecutionId) -> Result<bool> {
        match self.store.get_execution(id).await? {
            Some(exec) => Ok(exec.status == ExecutionStatus::Cancelled),
            None => Ok(true),
        }
    }

    /// `pending -> running`
    pub async fn start(&self, id: &ExecutionId) -> Result<Execution> {
        self.transition(
            id,
            Some(ExecutionStatus::Pending),
            StatusUpdate::to(ExecutionStatus::Running),
        )
        .await
    }

    /// `running -> completed`
    pub async fn complete(
        &self,
        id: &ExecutionId,
        outputs: Value,
        state: Option<Value>,
        metrics: ExecutionMetrics,
    ) -> Result<Execution> {
        let mut update = StatusUpdate::to(ExecutionStatus::Completed)
            .with_outputs(outputs)
            .with_metrics(metrics);
        update.state = state;
        self.transition(id, None, update).await
    }

    /// `pending | running -> failed`
    pub async fn fail(
        &self,
        id: &ExecutionId,
        error: &str,
        state: Option<Value>,
        metrics: Option<ExecutionMetrics>,
    ) -> Result<Execution> {
        let mut update = StatusUpdate::to(ExecutionStatus::Failed).with_error(error);
        update.state = state;
        update.metrics = metrics;
        self.transition(id, None, update).await
    }

    /// `running -> waiting_human`
    pub async fn suspend(&self, id: &ExecutionId, state: Option<Value>) -> Result<Execution> {
        let mut update = StatusUpdate::to(ExecutionStatus::WaitingHuman);
        update.state = state;
        self.transition(id, None, update).await
    }

    /// `pending | running -> cancelled`
    ///
    /// Signals the run's job and emits `cancelled`. The run itself stops at
    /// its next step boundary.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<Execution> {
        let updated = self
            .compare_and_set(id, None, StatusUpdate::to(ExecutionStatus::Cancelled))
            .await?;

        let Some(execution) = updated else {
            let current = self.get(id).await?;
            return Err(CrewflowError::CannotCancel {
                id: id.to_string(),
                status: current.status,
            });
        };

        let signalled = self.cancels.cancel(id);
        debug!(execution_id = %id, signalled, "Execution cancelled");
        self.broadcaster
            .publish(ExecutionEvent::new(id.clone(), EventPayload::Cancelled))
            .await;
        Ok(execution)
    }

    /// `waiting_human -> running`, emitting `feedback_received`.
    ///
    /// The caller is responsible for scheduling the resumed run.
    pub async fn submit_feedback(&self, id: &ExecutionId, feedback: &Value) -> Result<Execution> {
        let updated = self
            .compare_and_set(
                id,
                Some(ExecutionStatus::WaitingHuman),
                StatusUpdate::to(ExecutionStatus::Running),
            )
            .await?;

        let Some(execution) = updated else {
            let current = self.get(id).await?;
            return Err(CrewflowError::InvalidState {
                id: id.to_string(),
                status: current.status,
                expected: ExecutionStatus::WaitingHuman,
            });
        };

        info!(execution_id = %id, "Human feedback received");
        self.broadcaster
            .publish(ExecutionEvent::new(
                id.clone(),
                EventPayload::FeedbackReceived {
                    feedback: feedback.clone(),
                },
            ))
            .await;
        Ok(execution)
    }

    /// CAS into `update.status` from the statuses `ExecutionStatus::sources_of`
    /// allows, narrowed to `only` when given. `None` on mismatch.
    async fn compare_and_set(
        &self,
        id: &ExecutionId,
        only: Option<ExecutionStatus>,
        update: StatusUpdate,
    ) -> Result<Option<Execution>> {
        let from: Vec<ExecutionStatus> = ExecutionStatus::sources_of(update.status)
            .iter()
            .copied()
            .filter(|status| only.map_or(true, |o| o == *status))
            .collect();
        self.store.update_status(id, &from, update).await
    }

    async fn transition(
        &self,
        id: &ExecutionId,
        only: Option<ExecutionStatus>,
        update: StatusUpdate,
    ) -> Result<Execution> {
        let to = update.status;
        match self.compare_and_set(id, only, update).await? {
            Some(execution) => {
                debug!(execution_id = %id, status = %to, "Execution status updated");
                Ok(execution)
            }
            None => {
                let current = self.get(id).await?;
                Err(CrewflowError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_test_utils::{drain_events, MemoryStore};
    use serde_json::json;

    struct Fixture {
        manager: ExecutionManager,
        broadcaster: Arc<EventBroadcaster>,
        cancels: Arc<CancelRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(EventBroadcaster::local(32));
        let cancels = Arc::new(CancelRegistry::new());
        Fixture {
            manager: ExecutionManager::new(store, broadcaster.clone(), cancels.clone()),
            broadcaster,
            cancels,
        }
    }

    async fn running(f: &Fixture) -> ExecutionId {
        let exec = f
            .manager
            .create(ExecutionKind::Flow, "flow-1", Map::new(), "manual")
            .await
            .unwrap();
        f.manager.start(&exec.id).await.unwrap();
        exec.id
    }

    #[tokio::test]
    async fn test_operations_follow_status_table() {
        use ExecutionStatus::*;
        let all = [Pending, Running, WaitingHuman, Completed, Failed, Cancelled];
        for current in all {
            let f = fixture();
            let store = f.manager.store().clone();
            let mut ids = Vec::new();
            for _ in 0..4 {
                let exec = f
                    .manager
                    .create(ExecutionKind::Flow, "flow-1", Map::new(), "manual")
                    .await
                    .unwrap();
                if current != Pending {
                    store
                        .update_status(&exec.id, &[Pending], StatusUpdate::to(current))
                        .await
                        .unwrap()
                        .unwrap();
                }
                ids.push(exec.id);
            }

            let completed = f
                .manager
                .complete(&ids[0], json!({}), None, ExecutionMetrics::default())
                .await;
            assert_eq!(completed.is_ok(), current.can_transition_to(Completed), "{current} -> completed");
            let failed = f.manager.fail(&ids[1], "boom", None, None).await;
            assert_eq!(failed.is_ok(), current.can_transition_to(Failed), "{current} -> failed");
            let suspended = f.manager.suspend(&ids[2], None).await;
            assert_eq!(suspended.is_ok(), current.can_transition_to(WaitingHuman), "{current} -> waiting_human");
            let cancelled = f.manager.cancel(&ids[3]).await;
            assert_eq!(cancelled.is_ok(), current.can_transition_to(Cancelled), "{current} -> cancelled");
        }
    }

    #[tokio::test]
    async fn test_happy_path_timestamps() {
        let f = fixture();
        let exec = f
            .manager
            .create(ExecutionKind::Flow, "flow-1", Map::new(), "api")
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);

        let started = f.manager.start(&exec.id).await.unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());

        let done = f
            .manager
            .complete(
                &exec.id,
                json!({"ok": true}),
                Some(json!({"k": 1})),
                ExecutionMetrics {
                    duration_ms: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.outputs, Some(json!({"ok": true})));
        assert_eq!(done.metrics.duration_ms, Some(5));
    }

    #[tokio::test]
    async fn test_terminal_rejects_everything() {
        let f = fixture();
        let id = running(&f).await;
        f.manager.fail(&id, "boom", None, None).await.unwrap();

        let err = f.manager.start(&id).await.unwrap_err();
        assert!(matches!(
            err,
            CrewflowError::InvalidTransition {
                from: ExecutionStatus::Failed,
                to: ExecutionStatus::Running,
                ..
            }
        ));
        assert!(f
            .manager
            .complete(&id, Value::Null, None, ExecutionMetrics::default())
            .await
            .is_err());
        assert!(matches!(
            f.manager.cancel(&id).await.unwrap_err(),
            CrewflowError::CannotCancel {
                status: ExecutionStatus::Failed,
                ..
            }
        ));
        let exec = f.manager.get(&id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancel_signals_and_emits() {
        let f = fixture();
        let id = running(&f).await;
        let token = f.cancels.token(&id);
        let mut sub = f.broadcaster.subscribe(&id);

        let exec = f.manager.cancel(&id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.completed_at.is_some());
        assert!(token.is_cancelled());
        assert!(f.manager.is_cancelled(&id).await.unwrap());

        let events = drain_events(&mut sub);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_pending_and_waiting() {
        let f = fixture();
        let exec = f
            .manager
            .create(ExecutionKind::Crew, "crew-1", Map::new(), "api")
            .await
            .unwrap();
        f.manager.cancel(&exec.id).await.unwrap();

        let id = running(&f).await;
        f.manager.suspend(&id, None).await.unwrap();
        let err = f.manager.cancel(&id).await.unwrap_err();
        assert!(matches!(
            err,
            CrewflowError::CannotCancel {
                status: ExecutionStatus::WaitingHuman,
                ..
            }
        ));
        assert_eq!(f.manager.status(&id).await.unwrap(), ExecutionStatus::WaitingHuman);
    }

    #[tokio::test]
    async fn test_feedback_only_while_waiting() {
        let f = fixture();
        let id = running(&f).await;

        let err = f.manager.submit_feedback(&id, &json!("yes")).await.unwrap_err();
        assert!(matches!(
            err,
            CrewflowError::InvalidState {
                status: ExecutionStatus::Running,
                expected: ExecutionStatus::WaitingHuman,
                ..
            }
        ));

        let suspended = f.manager.suspend(&id, Some(json!({"awaiting_human_feedback": true}))).await.unwrap();
        assert_eq!(suspended.state, Some(json!({"awaiting_human_feedback": true})));

        let mut sub = f.broadcaster.subscribe(&id);
        let resumed = f.manager.submit_feedback(&id, &json!("yes")).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        match &drain_events(&mut sub)[0].payload {
            EventPayload::FeedbackReceived { feedback } => assert_eq!(feedback, &json!("yes")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let f = fixture();
        let ghost = ExecutionId::new();
        assert!(matches!(
            f.manager.get(&ghost).await.unwrap_err(),
            CrewflowError::ExecutionNotFound(_)
        ));
        assert!(matches!(
            f.manager.cancel(&ghost).await.unwrap_err(),
            CrewflowError::ExecutionNotFound(_)
        ));
        assert!(f.manager.is_cancelled(&ghost).await.unwrap());
    }
}
