//! Chat message, thread and attachment types shared by the reconciler, stores and callers.

use serde::{Deserialize, Serialize};

/// Opaque message identifier.
pub type MessageId = String;

/// Opaque thread identifier (backend-assigned, or local for guest/provisional threads).
pub type ThreadId = String;

/// Largest attachment accepted by [`Attachment::new`] (10 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Delivery status. `Pending` covers both "in flight" and "queued offline".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Sent,
    Error,
}

/// A single message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub status: Status,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            status: Status::Pending,
            created_at: now_ms(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Empty pending assistant message that streamed tokens are appended to.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, "")
    }
}

/// Thread reference shown in thread lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRef {
    pub thread_id: ThreadId,
    pub title: String,
    pub created_at: i64,
    /// Created while offline in user mode; the backend has not assigned an id yet.
    #[serde(default)]
    pub provisional: bool,
}

impl ThreadRef {
    pub fn new(thread_id: impl Into<ThreadId>) -> Self {
        Self {
            thread_id: thread_id.into(),
            title: DEFAULT_THREAD_TITLE.to_string(),
            created_at: now_ms(),
            provisional: false,
        }
    }
}

pub const DEFAULT_THREAD_TITLE: &str = "New chat";

/// File attached to a message. Only attachments with an uploaded `url` reach the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("attachment {name} is {size} bytes (limit {limit})")]
    TooLarge { name: String, size: u64, limit: u64 },
}

impl Attachment {
    /// Describe a file to attach; rejects files above [`MAX_ATTACHMENT_BYTES`].
    pub fn new(
        name: impl Into<String>,
        size: u64,
        content_type: impl Into<String>,
        url: Option<String>,
    ) -> Result<Self, AttachmentError> {
        let name = name.into();
        if size > MAX_ATTACHMENT_BYTES {
            return Err(AttachmentError::TooLarge {
                name,
                size,
                limit: MAX_ATTACHMENT_BYTES,
            });
        }
        Ok(Self {
            name,
            size,
            content_type: content_type.into(),
            url,
        })
    }

    pub fn is_uploaded(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Generate a new opaque id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_camel_case_lowercase_enums() {
        let mut m = Message::user("hi");
        m.status = Status::Sent;
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["status"], "sent");
        assert!(v.get("createdAt").is_some());
    }

    #[test]
    fn attachment_over_limit_is_rejected() {
        let err = Attachment::new("big.bin", MAX_ATTACHMENT_BYTES + 1, "application/octet-stream", None)
            .unwrap_err();
        assert!(matches!(err, AttachmentError::TooLarge { .. }));
        let ok = Attachment::new("a.png", 10, "image/png", Some("https://cdn/a.png".into())).unwrap();
        assert!(ok.is_uploaded());
    }
}
