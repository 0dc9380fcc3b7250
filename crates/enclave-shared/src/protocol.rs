use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryState, IdentityId, MessageId, MessageType, RoomId};

/// A persisted chat message as stored and as pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    /// Conversation or channel the message was posted to
    pub target: RoomId,
    /// Position within the target, strictly increasing
    pub seq: i64,
    pub sender_id: IdentityId,
    /// Sender display name copied at write time for immediate rendering
    pub sender_display_name: Option<String>,
    pub body: String,
    pub message_type: MessageType,
    /// Optimistic id the sending client attached, echoed back for dedup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    pub delivery_state: DeliveryState,
    pub created_at: DateTime<Utc>,
}

/// Frames a client sends over its live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        room: RoomId,
    },
    LeaveRoom {
        room: RoomId,
    },
    SendMessage {
        #[serde(default)]
        client_ref: Option<String>,
        target: RoomId,
        body: String,
    },
    AckDelivered {
        message_id: MessageId,
    },
    AckRead {
        message_id: MessageId,
    },
    Ping,
}

/// Frames the server pushes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined {
        room: RoomId,
    },
    /// Sent on an explicit leave and when membership is revoked.
    Left {
        room: RoomId,
    },
    /// Acknowledgment to the connection that submitted the message.
    MessageSent {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        message: ChatMessage,
    },
    MessageReceived {
        message: ChatMessage,
    },
    StatusUpdated {
        message_id: MessageId,
        room: RoomId,
        state: DeliveryState,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
    Pong,
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(code: &str, message: impl Into<String>, client_ref: Option<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
            client_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationId;

    #[test]
    fn test_parse_send_message() {
        let conversation = ConversationId::new();
        let text = format!(
            r#"{{"type":"send_message","client_ref":"tmp-1","target":{{"conversation":"{}"}},"body":"hi"}}"#,
            conversation
        );

        let event = ClientEvent::from_json(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                client_ref: Some("tmp-1".into()),
                target: RoomId::Conversation(conversation),
                body: "hi".into(),
            }
        );
    }

    #[test]
    fn test_send_message_requires_exactly_one_target() {
        let text = r#"{"type":"send_message","target":{},"body":"hi"}"#;
        assert!(ClientEvent::from_json(text).is_err());

        let text = r#"{"type":"send_message","body":"hi"}"#;
        assert!(ClientEvent::from_json(text).is_err());
    }

    #[test]
    fn test_status_update_carries_message_id() {
        let message_id = MessageId::new();
        let room = RoomId::Conversation(ConversationId::new());
        let json = ServerEvent::StatusUpdated {
            message_id,
            room,
            state: DeliveryState::Read,
        }
        .to_json()
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "status_updated");
        assert_eq!(value["message_id"], message_id.0.to_string());
        assert_eq!(value["state"], "read");
    }

    #[test]
    fn test_error_omits_missing_client_ref() {
        let json = ServerEvent::error("forbidden", "not a member", None)
            .to_json()
            .unwrap();
        assert!(!json.contains("client_ref"));
    }
}
