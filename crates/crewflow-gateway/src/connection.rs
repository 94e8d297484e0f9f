use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crewflow_core::types::ExecutionId;
use crewflow_engine::ExecutionService;

use crate::protocol::{ClientMessage, ServerMessage};

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn send_json<T: serde::Serialize>(tx: &WsSink, value: &T) -> bool {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize frame");
            return true;
        }
    };
    let mut tx = tx.lock().await;
    tx.send(Message::Text(json.into())).await.is_ok()
}

async fn close(tx: &WsSink) {
    let mut tx = tx.lock().await;
    let _ = tx.send(Message::Close(None)).await;
}

/// Observe one execution over a WebSocket.
///
/// The observer gets a `connected` frame with the current status, then every
/// event of the run until a final one, after which the socket is closed.
/// It may send `cancel`, `human_feedback` and `ping` frames meanwhile.
pub async fn handle_connection(ws: WebSocket, service: Arc<ExecutionService>, id: ExecutionId) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx: WsSink = Arc::new(Mutex::new(ws_tx));

    // Subscribe before reading the status so no event slips in between
    let mut subscription = service.subscribe(&id);

    let execution = match service.get(&id).await {
        Ok(execution) => execution,
        Err(e) => {
            send_json(&ws_tx, &ServerMessage::error(e.to_string())).await;
            close(&ws_tx).await;
            return;
        }
    };

    let connected = ServerMessage::Connected {
        execution_id: id.clone(),
        status: execution.status,
    };
    if !send_json(&ws_tx, &connected).await {
        return;
    }
    if execution.status.is_terminal() {
        close(&ws_tx).await;
        return;
    }

    let event_ws_tx = ws_tx.clone();
    let mut event_task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let last = event.is_final();
            if !send_json(&event_ws_tx, &event).await {
                return;
            }
            if last {
                break;
            }
        }
        close(&event_ws_tx).await;
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = &mut event_task => break,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(frame) => process_message(frame, &service, &id).await,
                    Err(e) => ServerMessage::error(format!("Parse error: {}", e)),
                };
                if !send_json(&ws_tx, &reply).await {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let mut tx = ws_tx.lock().await;
                let _ = tx.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    event_task.abort();
    debug!(execution_id = %id, "Connection closed");
}

async fn process_message(
    frame: ClientMessage,
    service: &ExecutionService,
    id: &ExecutionId,
) -> ServerMessage {
    match frame {
        ClientMessage::Ping => ServerMessage::Pong,
        ClientMessage::Cancel => match service.cancel(id).await {
            Ok(_) => ServerMessage::Cancelled {
                execution_id: id.clone(),
            },
            Err(e) => ServerMessage::error(e.to_string()),
        },
        ClientMessage::HumanFeedback { feedback } => {
            match service.submit_feedback(id, feedback).await {
                Ok(execution) => ServerMessage::FeedbackSubmitted {
                    execution_id: id.clone(),
                    result: serde_json::json!({ "status": execution.status }),
                },
                Err(e) => ServerMessage::error(e.to_string()),
            }
        }
    }
}
