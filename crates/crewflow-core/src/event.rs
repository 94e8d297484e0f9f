use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::EventTransport;
use crate::types::{ExecutionId, ExecutionMetrics};

/// Event emitted during an execution.
///
/// Serializes flat: `{"type", "execution_id", "timestamp", ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ExecutionEvent {
    pub fn new(execution_id: ExecutionId, payload: EventPayload) -> Self {
        Self {
            execution_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// No further events follow a final one.
    pub fn is_final(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Complete { .. } | EventPayload::Error { .. } | EventPayload::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Start {
        message: String,
        inputs: Value,
    },
    FlowLoaded {
        flow_name: String,
        steps_count: usize,
    },
    StepStart {
        step_name: String,
        step_type: String,
    },
    StepComplete {
        step_name: String,
        step_type: String,
    },
    HumanInputRequired {
        step_name: String,
        prompt: String,
        options: Vec<Value>,
    },
    FeedbackReceived {
        feedback: Value,
    },
    Complete {
        output: Value,
        metrics: ExecutionMetrics,
        message: String,
    },
    Error {
        message: String,
        error: String,
    },
    Cancelled,
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::FlowLoaded { .. } => "flow_loaded",
            Self::StepStart { .. } => "step_start",
            Self::StepComplete { .. } => "step_complete",
            Self::HumanInputRequired { .. } => "human_input_required",
            Self::FeedbackReceived { .. } => "feedback_received",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// An event as carried between processes, tagged with the publishing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEnvelope {
    pub origin: String,
    pub event: ExecutionEvent,
}

type ObserverMap = HashMap<ExecutionId, Vec<mpsc::Sender<ExecutionEvent>>>;

/// Per-execution fan-out of events to live observers.
///
/// Local observers get events synchronously on publish. Every event is also
/// forwarded to the transport; the relay task delivers events published by
/// other nodes. An observer whose buffer is full is dropped rather than
/// allowed to stall the run.
pub struct EventBroadcaster {
    origin: String,
    buffer: usize,
    observers: Arc<Mutex<ObserverMap>>,
    transport: Arc<dyn EventTransport>,
}

/// A live observer of one execution.
pub struct Subscription {
    execution_id: ExecutionId,
    rx: mpsc::Receiver<ExecutionEvent>,
}

impl Subscription {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Next event, or `None` once the broadcaster dropped this observer.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.try_recv().ok()
    }
}

impl EventBroadcaster {
    pub fn new(transport: Arc<dyn EventTransport>, buffer: usize) -> Self {
        Self {
            origin: uuid::Uuid::new_v4().to_string(),
            buffer: buffer.max(1),
            observers: Arc::new(Mutex::new(HashMap::new())),
            transport,
        }
    }

    /// Broadcaster without cross-process delivery.
    pub fn local(buffer: usize) -> Self {
        Self::new(Arc::new(LocalTransport), buffer)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn subscribe(&self, execution_id: &ExecutionId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Ok(mut observers) = self.observers.lock() {
            observers.entry(execution_id.clone()).or_default().push(tx);
        }
        Subscription {
            execution_id: execution_id.clone(),
            rx,
        }
    }

    /// Deliver to local observers, then forward to the transport.
    ///
    /// Transport failures are logged; they never fail the run.
    pub async fn publish(&self, event: ExecutionEvent) {
        deliver_local(&self.observers, &event);

        let envelope = TransportEnvelope {
            origin: self.origin.clone(),
            event,
        };
        if let Err(e) = self.transport.publish(envelope).await {
            warn!(transport = self.transport.name(), error = %e, "Event transport publish failed");
        }
    }

    pub fn observer_count(&self, execution_id: &ExecutionId) -> usize {
        self.observers
            .lock()
            .map(|o| o.get(execution_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Start delivering events published by other nodes to local observers.
    ///
    /// The transport subscription is live when this returns.
    pub async fn start_relay(&self) -> Result<tokio::task::JoinHandle<()>> {
        let mut stream = self.transport.subscribe().await?;
        let observers = self.observers.clone();
        let origin = self.origin.clone();
        let transport = self.transport.name().to_string();

        Ok(tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                if envelope.origin == origin {
                    continue;
                }
                deliver_local(&observers, &envelope.event);
            }
            debug!(transport = %transport, "Event relay stream ended");
        }))
    }
}

fn deliver_local(observers: &Mutex<ObserverMap>, event: &ExecutionEvent) {
    let Ok(mut observers) = observers.lock() else {
        return;
    };
    let Some(senders) = observers.get_mut(&event.execution_id) else {
        return;
    };

    senders.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                execution_id = %event.execution_id,
                "Dropping slow event observer"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });

    if senders.is_empty() {
        observers.remove(&event.execution_id);
    }
}

/// In-process only: publishes go nowhere, the subscription is empty.
pub struct LocalTransport;

impl EventTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn publish(&self, _envelope: TransportEnvelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<BoxStream<'static, TransportEnvelope>>> {
        Box::pin(async { Ok(futures::stream::empty().boxed()) })
    }
}

/// Shared in-memory bus. Clones share one channel, so several broadcasters
/// built on clones behave like nodes on one pub/sub server.
#[derive(Clone)]
pub struct BroadcastTransport {
    tx: broadcast::Sender<TransportEnvelope>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventTransport for BroadcastTransport {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn publish(&self, envelope: TransportEnvelope) -> BoxFuture<'_, Result<()>> {
        // Ignore error if no receivers
        let _ = self.tx.send(envelope);
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<BoxStream<'static, TransportEnvelope>>> {
        let rx = self.tx.subscribe();
        Box::pin(async move {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => return Some((envelope, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Event relay lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}

#[cfg(feature = "redis")]
pub use self::redis_transport::RedisTransport;

#[cfg(feature = "redis")]
mod redis_transport {
    use super::*;
    use crate::error::CrewflowError;

    /// Redis pub/sub. One channel per execution (`execution:{id}`),
    /// relayed through a pattern subscription on `execution:*`.
    pub struct RedisTransport {
        client: redis::Client,
    }

    impl RedisTransport {
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| CrewflowError::Transport(format!("invalid redis url: {}", e)))?;
            Ok(Self { client })
        }

        pub fn channel(execution_id: &ExecutionId) -> String {
            format!("execution:{}", execution_id)
        }
    }

    impl EventTransport for RedisTransport {
        fn name(&self) -> &str {
            "redis"
        }

        fn publish(&self, envelope: TransportEnvelope) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                let channel = Self::channel(&envelope.event.execution_id);
                let payload = serde_json::to_string(&envelope)?;
                let mut conn = self
                    .client
                    .get_async_connection()
                    .await
                    .map_err(|e| CrewflowError::Transport(format!("redis connection error: {}", e)))?;
                let _: i64 = redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CrewflowError::Transport(format!("redis publish error: {}", e)))?;
                Ok(())
            })
        }

        fn subscribe(&self) -> BoxFuture<'_, Result<BoxStream<'static, TransportEnvelope>>> {
            Box::pin(async move {
                let conn = self
                    .client
                    .get_async_connection()
                    .await
                    .map_err(|e| CrewflowError::Transport(format!("redis connection error: {}", e)))?;
                let mut pubsub = conn.into_pubsub();
                pubsub
                    .psubscribe("execution:*")
                    .await
                    .map_err(|e| CrewflowError::Transport(format!("redis subscribe error: {}", e)))?;

                let stream = pubsub.into_on_message().filter_map(|msg| async move {
                    let payload: String = msg.get_payload().ok()?;
                    match serde_json::from_str::<TransportEnvelope>(&payload) {
                        Ok(envelope) => Some(envelope),
                        Err(e) => {
                            warn!(channel = msg.get_channel_name(), error = %e, "Malformed event on redis channel");
                            None
                        }
                    }
                });
                Ok(stream.boxed())
            })
        }
    }
}
