use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Commands sent FROM client TO server over the WebSocket gateway.
///
/// The `authenticate` frame carries a signed token; the server derives the
/// user id from the token claims and never from anything the client asserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection with a JWT.
    Authenticate { token: String },

    /// Send a chat message into a conversation the caller participates in.
    ChatMessage {
        conversation_id: Uuid,
        body: String,
        #[serde(default)]
        attachments: Vec<String>,
    },
}

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    /// Server confirms successful authentication.
    Authenticated { user_id: Uuid },

    /// A persisted message, fanned out to every live session of every
    /// participant of the conversation (the sender's sessions included).
    NewMessage { message: Message },

    /// A command was rejected. Sent to the offending session only.
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_wire_shape() {
        let cid = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"chat_message","data":{{"conversationId":"{}","body":"hi"}}}}"#,
            cid
        );
        let cmd: GatewayCommand = serde_json::from_str(&raw).unwrap();
        match cmd {
            GatewayCommand::ChatMessage {
                conversation_id,
                body,
                attachments,
            } => {
                assert_eq!(conversation_id, cid);
                assert_eq!(body, "hi");
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn error_event_omits_absent_conversation() {
        let json = serde_json::to_value(GatewayEvent::Error {
            error: "not permitted".into(),
            conversation_id: None,
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert!(json["data"].get("conversationId").is_none());
    }

    #[test]
    fn authenticated_event_wire_shape() {
        let uid = Uuid::new_v4();
        let json = serde_json::to_value(GatewayEvent::Authenticated { user_id: uid }).unwrap();
        assert_eq!(json["type"], "authenticated");
        assert_eq!(json["data"]["userId"], uid.to_string());
    }
}
