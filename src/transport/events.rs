// Typed channel events
// Every named Socket.IO event the engine understands maps onto one variant here

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{MessageRecord, UserStatus};

/// Payload of `userStatusChanged`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: UserStatus,
    #[serde(rename = "statusUpdatedAt", default)]
    pub status_updated_at: Option<DateTime<Utc>>,
}

/// Payload of `userTyping`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingNotice {
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Payload of `messageError`
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailure {
    pub client_id: Option<String>,
    pub reason: String,
}

impl SendFailure {
    /// The server sends either a bare string or an object with a message field
    fn from_payload(payload: &Value) -> Self {
        let client_id = payload
            .get("clientId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let reason = match payload {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .or_else(|| other.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("message could not be delivered")
                .to_string(),
        };
        SendFailure { client_id, reason }
    }
}

/// Everything the channel delivers to the session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    ConnectError(String),
    Disconnected(String),
    /// The server refused the channel credential
    AuthRejected(String),
    MessageReceived(MessageRecord),
    MessageSent(MessageRecord),
    MessageError(SendFailure),
    UserStatusChanged(StatusChange),
    UserTyping(TypingNotice),
}

impl InboundEvent {
    /// Decode a named application event. Unknown names yield `Ok(None)`.
    pub fn from_named(name: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            "messageReceived" => InboundEvent::MessageReceived(serde_json::from_value(payload)?),
            "messageSent" => InboundEvent::MessageSent(serde_json::from_value(payload)?),
            "messageError" => InboundEvent::MessageError(SendFailure::from_payload(&payload)),
            "userStatusChanged" => InboundEvent::UserStatusChanged(serde_json::from_value(payload)?),
            "userTyping" => InboundEvent::UserTyping(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            InboundEvent::Connected
                | InboundEvent::ConnectError(_)
                | InboundEvent::Disconnected(_)
                | InboundEvent::AuthRejected(_)
        )
    }
}

/// Events the session emits over the channel
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    SendMessage {
        receiver_id: String,
        content: String,
        client_id: String,
    },
    Typing {
        receiver_id: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SendMessage { .. } => "sendMessage",
            OutboundEvent::Typing { .. } => "typing",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::SendMessage { receiver_id, content, client_id } => json!({
                "receiverId": receiver_id,
                "content": content,
                "clientId": client_id,
            }),
            OutboundEvent::Typing { receiver_id } => json!({ "receiverId": receiver_id }),
        }
    }
}
