// Core data model shared by the sync engine and its front ends
// Wire records mirror the server's JSON (camelCase, Mongo-style `_id`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Presence status of a user as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    #[default]
    Offline,
}

impl UserStatus {
    /// The status a punch in/out action moves to
    pub fn toggled(self) -> Self {
        match self {
            UserStatus::Online => UserStatus::Offline,
            UserStatus::Offline => UserStatus::Online,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserStatus::Online => write!(f, "Online"),
            UserStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// The authenticated user owning a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(rename = "statusUpdatedAt", default)]
    pub status_updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Another user as seen by the current identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(rename = "statusUpdatedAt", default)]
    pub status_updated_at: Option<DateTime<Utc>>,
}

impl Peer {
    /// Copy status fields onto this peer
    pub fn set_presence(&mut self, status: UserStatus, at: Option<DateTime<Utc>>) {
        self.status = status;
        self.status_updated_at = at;
    }
}

/// Delivery state of a message in the local history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending, // Sent over the channel, waiting for acknowledgement
    Sent,    // Acknowledged by the server, or received from a peer
    Error,   // The server reported a failure for this send
}

/// A message record as carried by REST history and channel events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A message in the local conversation history
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub delivery: DeliveryState,
    /// Correlation id for messages sent from this client
    pub client_id: Option<String>,
}

impl Message {
    /// Build a local optimistic entry for an outgoing message
    pub fn pending(
        client_id: &str,
        sender: &str,
        receiver: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Message {
            // Local entries use the correlation id until the server assigns one
            id: client_id.to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: content.to_string(),
            timestamp: Some(at),
            created_at: None,
            delivery: DeliveryState::Pending,
            client_id: Some(client_id.to_string()),
        }
    }

    /// The timestamp used for ordering and display
    pub fn display_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.or(self.created_at)
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender == user_id
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Message {
            id: record.id,
            sender: record.sender,
            receiver: record.receiver,
            content: record.content,
            timestamp: record.timestamp,
            created_at: record.created_at,
            delivery: DeliveryState::Sent,
            client_id: record.client_id,
        }
    }
}
