//! WebSocket wire format
//!
//! Every frame is a JSON text frame `{"event": "<name>", "data": {...}}`.

use crate::error::ChatError;
use crate::models::{Message, Role};
use serde::{Deserialize, Serialize};

/// Close code: connection opened without any credential
pub const CLOSE_NO_CREDENTIAL: u16 = 4001;
/// Close code: credential present but rejected
pub const CLOSE_INVALID_CREDENTIAL: u16 = 4002;
/// Close code: tenant store could not be opened
pub const CLOSE_STORE_UNAVAILABLE: u16 = 1011;
/// Close code: liveness pings went unanswered
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate(AuthenticatePayload),
    SendMessage(SendMessagePayload),
    TypingStatus(TypingPayload),
    MessageSeen(MessageSeenPayload),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub receiver_id: String,
    pub receiver_role: Role,
    #[serde(alias = "message")]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub receiver_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSeenPayload {
    pub message_id: String,
    /// Informational; the receipt goes to the sender stored on the message
    #[serde(default)]
    pub sender_id: Option<String>,
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ChatError> {
        serde_json::from_str(text).map_err(|e| ChatError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection")]
    Connection(ConnectionAck),
    #[serde(rename = "receive_message")]
    ReceiveMessage(Message),
    #[serde(rename = "message_sent")]
    MessageSent(MessageAck),
    #[serde(rename = "user_typing")]
    UserTyping(UserTyping),
    #[serde(rename = "message_status_update")]
    MessageStatusUpdate(MessageAck),
    #[serde(rename = "userStatus")]
    UserStatus(UserStatus),
    #[serde(rename = "error")]
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    pub status: String,
    pub identity_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    pub message_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
}

impl ServerEvent {
    pub fn sent(message_id: &str) -> Self {
        ServerEvent::MessageSent(MessageAck {
            message_id: message_id.to_string(),
            status: "sent".to_string(),
        })
    }

    pub fn seen(message_id: &str) -> Self {
        ServerEvent::MessageStatusUpdate(MessageAck {
            message_id: message_id.to_string(),
            status: "seen".to_string(),
        })
    }

    pub fn presence(user_id: &str, is_online: bool) -> Self {
        ServerEvent::UserStatus(UserStatus {
            user_id: user_id.to_string(),
            is_online,
        })
    }

    pub fn error(err: &ChatError) -> Self {
        ServerEvent::Error(ErrorEvent {
            code: err.code().to_string(),
            message: err.to_string(),
        })
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_events() {
        let send = ClientEvent::parse(
            r#"{"event":"send_message","data":{"receiverId":"b","receiverRole":"MEMBER","message":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            send,
            ClientEvent::SendMessage(SendMessagePayload {
                receiver_id: "b".into(),
                receiver_role: Role::Member,
                body: "hi".into(),
            })
        );

        let pong = ClientEvent::parse(r#"{"event":"pong"}"#).unwrap();
        assert_eq!(pong, ClientEvent::Pong);

        let seen = ClientEvent::parse(r#"{"event":"message_seen","data":{"messageId":"m1"}}"#).unwrap();
        assert!(matches!(seen, ClientEvent::MessageSeen(p) if p.sender_id.is_none()));
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"delete_message","data":{}}"#),
            Err(ChatError::Protocol(_))
        ));
        assert!(ClientEvent::parse("not json").is_err());
        assert!(ClientEvent::parse(r#"{"event":"typing_status","data":{"isTyping":true}}"#).is_err());
    }

    #[test]
    fn server_event_wire_names() {
        let frame = ServerEvent::presence("u1", true).to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "userStatus");
        assert_eq!(value["data"]["userId"], "u1");
        assert_eq!(value["data"]["isOnline"], true);

        let frame = ServerEvent::sent("m1").to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "message_sent");
        assert_eq!(value["data"]["messageId"], "m1");
        assert_eq!(value["data"]["status"], "sent");
    }
}
