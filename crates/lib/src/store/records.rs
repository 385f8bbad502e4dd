//! Persisted record shapes for the message and outbox tables.

use super::Record;
use crate::message::{Attachment, Message, MessageId, Role, Status, ThreadId};
use serde::{Deserialize, Serialize};

/// A message as stored across restarts: the message plus its thread and workspace scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub status: Status,
    pub created_at: i64,
}

impl PersistedMessage {
    pub fn from_message(m: &Message, thread_id: &str, workspace_id: Option<&str>) -> Self {
        Self {
            id: m.id.clone(),
            thread_id: thread_id.to_string(),
            workspace_id: workspace_id.map(str::to_string),
            role: m.role,
            content: m.content.clone(),
            status: m.status,
            created_at: m.created_at,
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            role: self.role,
            content: self.content,
            status: self.status,
            created_at: self.created_at,
        }
    }
}

impl Record for PersistedMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// A user message composed while offline, waiting for replay. Shares its id with the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: MessageId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Assistant placeholder that receives the reply once the entry is replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<MessageId>,
    /// The thread was created offline; the backend must create a real one before replay.
    #[serde(default)]
    pub needs_thread: bool,
}

impl Record for OutboxEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}
