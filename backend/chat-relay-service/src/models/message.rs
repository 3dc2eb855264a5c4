use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::Role;

/// Chat message as persisted and as fanned out to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub room_id: String,
    pub sender_email: String,
    pub sender_role: Role,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub read_status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub id: i64,
    pub sender_email: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl From<&ChatMessage> for MessagePreview {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            sender_email: message.sender_email.clone(),
            body: message.body.clone(),
            sent_at: message.sent_at,
        }
    }
}

/// One entry of a user's room list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub dealer_email: String,
    pub technician_email: String,
    pub scope_id: Option<String>,
    pub last_message: Option<MessagePreview>,
    pub unread_count: i64,
}
