use serde::{Deserialize, Serialize};
use serde_json::Value;

use crewflow_core::types::{ExecutionId, ExecutionStatus};

/// A message sent by a WebSocket observer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Cancel,
    HumanFeedback {
        #[serde(default)]
        feedback: Value,
    },
    Ping,
}

/// A control frame sent to a WebSocket observer.
///
/// Execution events are forwarded as-is, in their own envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    Cancelled {
        execution_id: ExecutionId,
    },
    FeedbackSubmitted {
        execution_id: ExecutionId,
        result: Value,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "cancel"})).unwrap();
        assert!(matches!(msg, ClientMessage::Cancel));

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "human_feedback", "feedback": "yes"})).unwrap();
        match msg {
            ClientMessage::HumanFeedback { feedback } => assert_eq!(feedback, json!("yes")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "reboot"})).is_err());
    }

    #[test]
    fn test_connected_frame() {
        let frame = ServerMessage::Connected {
            execution_id: ExecutionId::from_string("e1"),
            status: ExecutionStatus::WaitingHuman,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "connected", "execution_id": "e1", "status": "waiting_human"})
        );
    }
}
