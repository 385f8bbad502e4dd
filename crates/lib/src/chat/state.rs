//! In-memory conversation state: threads, per-thread message arenas and the published snapshot.
//!
//! Messages are addressed by id, never by position, so concurrent streams into
//! different placeholders cannot clobber each other.

use crate::message::{Message, MessageId, Status, ThreadId, ThreadRef};
use std::collections::HashMap;

/// Ordered messages of one thread with id lookup.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    order: Vec<MessageId>,
    by_id: HashMap<MessageId, Message>,
}

impl Conversation {
    /// Build from stored messages, ordered by creation time (stable for ties).
    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.created_at);
        let mut c = Self::default();
        for m in messages {
            c.push(m);
        }
        c
    }

    pub fn push(&mut self, message: Message) {
        if !self.by_id.contains_key(&message.id) {
            self.order.push(message.id.clone());
        }
        self.by_id.insert(message.id.clone(), message);
    }

    /// Insert `message` right after `anchor`, or at the end when `anchor` is gone.
    pub fn insert_after(&mut self, anchor: &str, message: Message) {
        if self.by_id.contains_key(&message.id) {
            return;
        }
        let at = self
            .order
            .iter()
            .position(|id| id == anchor)
            .map_or(self.order.len(), |i| i + 1);
        self.order.insert(at, message.id.clone());
        self.by_id.insert(message.id.clone(), message);
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.by_id.get_mut(id)
    }

    /// Append a streamed token to a message. Returns false when the message is gone.
    pub fn append(&mut self, id: &str, token: &str) -> bool {
        match self.by_id.get_mut(id) {
            Some(m) => {
                m.content.push_str(token);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&mut self, id: &str, status: Status) {
        if let Some(m) = self.by_id.get_mut(id) {
            m.status = status;
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Everything a UI needs to render the active thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub thread_id: Option<ThreadId>,
    pub threads: Vec<ThreadRef>,
    pub messages: Vec<Message>,
    /// At least one reply is streaming.
    pub streaming: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ChatState {
    pub active: Option<ThreadId>,
    pub threads: Vec<ThreadRef>,
    pub conversations: HashMap<ThreadId, Conversation>,
    pub streams: usize,
    pub last_error: Option<String>,
    /// Provisional thread ids that were rebound, mapped to their backend id.
    pub rebound: HashMap<ThreadId, ThreadId>,
}

impl ChatState {
    pub fn conversation_mut(&mut self, thread_id: &str) -> &mut Conversation {
        self.conversations
            .entry(thread_id.to_string())
            .or_default()
    }

    pub fn has_thread(&self, thread_id: &str) -> bool {
        self.threads.iter().any(|t| t.thread_id == thread_id)
    }

    /// Newest threads first.
    pub fn add_thread(&mut self, thread: ThreadRef) {
        if !self.has_thread(&thread.thread_id) {
            self.threads.insert(0, thread);
        }
    }

    /// Thread that holds message `id`, if loaded.
    pub fn thread_of(&self, id: &str) -> Option<&ThreadId> {
        self.conversations
            .iter()
            .find(|(_, c)| c.get(id).is_some())
            .map(|(t, _)| t)
    }

    /// Current id of a thread that may have been rebound since `id` was handed out.
    pub fn current_id(&self, id: &str) -> ThreadId {
        let mut id = id;
        while let Some(next) = self.rebound.get(id) {
            id = next;
        }
        id.to_string()
    }

    /// Whether the thread still waits for a backend id.
    pub fn is_provisional(&self, thread_id: &str) -> bool {
        self.threads
            .iter()
            .any(|t| t.thread_id == thread_id && t.provisional)
    }

    /// Move a provisional thread to its backend id.
    pub fn rebind(&mut self, from: &str, to: &str) {
        if from != to {
            self.rebound.insert(from.to_string(), to.to_string());
        }
        if let Some(c) = self.conversations.remove(from) {
            let target = self.conversations.entry(to.to_string()).or_default();
            for m in c.messages() {
                target.push(m);
            }
        }
        if let Some(t) = self.threads.iter_mut().find(|t| t.thread_id == from) {
            t.thread_id = to.to_string();
            t.provisional = false;
        }
        if self.active.as_deref() == Some(from) {
            self.active = Some(to.to_string());
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let messages = self
            .active
            .as_ref()
            .and_then(|t| self.conversations.get(t))
            .map(Conversation::messages)
            .unwrap_or_default();
        ChatSnapshot {
            thread_id: self.active.clone(),
            threads: self.threads.clone(),
            messages,
            streaming: self.streams > 0,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_target_by_id_not_position() {
        let mut c = Conversation::default();
        let a = Message::assistant_placeholder();
        let b = Message::assistant_placeholder();
        let (ida, idb) = (a.id.clone(), b.id.clone());
        c.push(a);
        c.push(b);
        c.push(Message::user("later"));
        assert!(c.append(&ida, "one"));
        assert!(c.append(&idb, "two"));
        assert!(!c.append("missing", "x"));
        assert_eq!(c.get(&ida).unwrap().content, "one");
        assert_eq!(c.get(&idb).unwrap().content, "two");
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn rebind_moves_messages_and_active_thread() {
        let mut s = ChatState::default();
        let mut t = ThreadRef::new("local-1");
        t.provisional = true;
        s.add_thread(t);
        s.active = Some("local-1".into());
        s.conversation_mut("local-1").push(Message::user("hi"));

        s.rebind("local-1", "srv-9");
        let snap = s.snapshot();
        assert_eq!(snap.thread_id.as_deref(), Some("srv-9"));
        assert_eq!(snap.messages.len(), 1);
        assert!(!snap.threads[0].provisional);
        assert!(!s.conversations.contains_key("local-1"));
        assert_eq!(s.current_id("local-1"), "srv-9");
        assert!(!s.is_provisional("srv-9"));
    }

    #[test]
    fn late_placeholder_lands_after_its_user_message() {
        let mut c = Conversation::default();
        let first = Message::user("first");
        let second = Message::user("second");
        let first_id = first.id.clone();
        c.push(first);
        c.push(second);
        let reply = Message::assistant_placeholder();
        let reply_id = reply.id.clone();
        c.insert_after(&first_id, reply.clone());
        c.insert_after(&first_id, reply);

        let order: Vec<String> = c.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(order.len(), 3);
        assert_eq!(order[1], reply_id);
    }
}
