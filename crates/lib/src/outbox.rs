//! Offline outbox: durable FIFO of user messages composed while offline, replayed on reconnect.
//!
//! Replay posts entries in creation order and dequeues each one only after the backend
//! accepted it; the first failure halts the run, leaving that entry and everything after
//! it queued for the next connectivity transition.

use crate::api::{ChatBackend, MessagePayload};
use crate::store::{OutboxEntry, StoreError, Table};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hooks called while a sync runs, so the owner can update its message state.
#[async_trait]
pub trait ReplayObserver: Send + Sync {
    /// A provisional (offline-created) thread received a real backend id.
    async fn thread_created(&self, _provisional: &str, _real: &str) {}
    /// The entry was accepted by the backend and removed from the outbox.
    async fn replayed(&self, _entry: &OutboxEntry) {}
}

impl ReplayObserver for () {}

/// Outcome of one sync run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Ids of entries sent and dequeued, in order.
    pub sent: Vec<String>,
    /// Entries still queued after the run.
    pub remaining: usize,
    /// Reason the run stopped early, if it did.
    pub halted: Option<String>,
    /// Another sync was already running; nothing was attempted.
    pub skipped: bool,
}

pub struct Outbox {
    table: Arc<dyn Table<OutboxEntry>>,
    syncing: AtomicBool,
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Outbox {
    pub fn new(table: Arc<dyn Table<OutboxEntry>>) -> Self {
        Self {
            table,
            syncing: AtomicBool::new(false),
        }
    }

    pub async fn enqueue(&self, entry: OutboxEntry) -> Result<(), StoreError> {
        log::info!("outbox: queued {} for thread {}", entry.id, entry.thread_id);
        self.table.put(entry).await
    }

    pub async fn dequeue(&self, id: &str) -> Result<(), StoreError> {
        self.table.delete(id).await
    }

    /// All queued entries, oldest first.
    pub async fn list_all(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        self.table.list_all().await
    }

    /// Move every entry queued for `from` to the backend thread `to`. Returns how many moved.
    pub async fn retarget(&self, from: &str, to: &str) -> Result<usize, StoreError> {
        let moved: Vec<OutboxEntry> = self
            .table
            .get_all_by_thread(from)
            .await?
            .into_iter()
            .map(|mut e| {
                e.thread_id = to.to_string();
                e.needs_thread = false;
                e
            })
            .collect();
        let n = moved.len();
        if n > 0 {
            self.table.put_many(moved).await?;
        }
        Ok(n)
    }

    /// Replay queued entries in order, halting on the first failure.
    pub async fn sync(
        &self,
        backend: &dyn ChatBackend,
        observer: &dyn ReplayObserver,
    ) -> SyncReport {
        if self.syncing.swap(true, Ordering::SeqCst) {
            log::debug!("offline sync: already running");
            return SyncReport {
                skipped: true,
                ..SyncReport::default()
            };
        }
        let _guard = SyncGuard(&self.syncing);

        let queued = match self.list_all().await {
            Ok(q) => q,
            Err(e) => {
                log::warn!("offline sync: cannot read outbox: {}", e);
                return SyncReport {
                    halted: Some(e.to_string()),
                    ..SyncReport::default()
                };
            }
        };
        if queued.is_empty() {
            return SyncReport::default();
        }
        log::info!("offline sync: start ({} queued)", queued.len());

        let total = queued.len();
        let mut report = SyncReport::default();
        let mut created: HashMap<String, String> = HashMap::new();

        for mut entry in queued {
            if entry.needs_thread {
                match self.resolve_thread(backend, observer, &entry, &mut created).await {
                    Ok(real) => {
                        entry.thread_id = real;
                        entry.needs_thread = false;
                    }
                    Err(reason) => {
                        report.halted = Some(reason);
                        break;
                    }
                }
            }

            let payload = MessagePayload::new(entry.content.clone(), &entry.attachments);
            if let Err(e) = backend.post_message(&entry.thread_id, &payload).await {
                log::warn!("offline sync: failed for {}: {}", entry.id, e);
                report.halted = Some(e.to_string());
                break;
            }
            if let Err(e) = self.dequeue(&entry.id).await {
                log::warn!("offline sync: sent {} but could not dequeue: {}", entry.id, e);
                report.halted = Some(e.to_string());
                break;
            }
            report.sent.push(entry.id.clone());
            observer.replayed(&entry).await;
        }

        report.remaining = total - report.sent.len();
        log::info!(
            "offline sync: done ({} sent, {} remaining)",
            report.sent.len(),
            report.remaining
        );
        report
    }

    /// Real thread id for an entry whose thread was created offline. Creates the backend thread
    /// once per provisional id and rewrites every queued entry of that thread, so a halted run
    /// never creates it twice.
    async fn resolve_thread(
        &self,
        backend: &dyn ChatBackend,
        observer: &dyn ReplayObserver,
        entry: &OutboxEntry,
        created: &mut HashMap<String, String>,
    ) -> Result<String, String> {
        if let Some(real) = created.get(&entry.thread_id) {
            return Ok(real.clone());
        }
        let real = backend.create_thread().await.map_err(|e| {
            log::warn!("offline sync: thread creation failed: {}", e);
            e.to_string()
        })?;
        let provisional = entry.thread_id.clone();
        self.retarget(&provisional, &real)
            .await
            .map_err(|e| e.to_string())?;
        log::info!("offline sync: thread {} is now {}", provisional, real);
        observer.thread_created(&provisional, &real).await;
        created.insert(provisional, real.clone());
        Ok(real)
    }
}
