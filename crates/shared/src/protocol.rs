use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{ConversationId, Cursor, MessageId, SenderRef},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: SenderRef,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEntry {
    pub id: ConversationId,
    /// `None` means untitled; the display layer picks a placeholder.
    #[serde(default)]
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Partial [`ThreadEntry`] carried by "thread updated" notifications.
///
/// Absent fields leave the entry untouched. `title: Some(None)` clears the title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPatch {
    pub id: ConversationId,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ThreadPatch {
    pub fn new(id: impl Into<ConversationId>) -> Self {
        Self {
            id: id.into(),
            title: None,
            updated_at: None,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = Some(title);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn apply_to(&self, entry: &mut ThreadEntry) {
        if let Some(title) = &self.title {
            entry.title = title.clone();
        }
        if let Some(updated_at) = self.updated_at {
            entry.updated_at = updated_at;
        }
    }
}

// Distinguishes an explicit `null` from a missing field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

pub type HistoryPage = Page<Message>;
pub type RosterPage = Page<ThreadEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSync {
    pub read_only: bool,
}

/// Frames pushed by the server over a conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ChannelFrame {
    #[serde(rename = "state-sync")]
    StateSync(StateSync),
    #[serde(rename = "message-created")]
    MessageCreated(Message),
    #[serde(rename = "error")]
    Error(ApiError),
}

/// Frames written by the client over a conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "message:new")]
    MessageNew { content: String },
}
