//! File-backed table: records held in memory, rewritten to a JSON file on every mutation.

use super::{Record, StoreError, Table};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Clone)]
struct Slot<R> {
    /// Insertion order; breaks ties between records created in the same millisecond.
    seq: u64,
    record: R,
}

#[derive(Clone)]
struct Inner<R> {
    slots: BTreeMap<String, Slot<R>>,
    next_seq: u64,
}

/// JSON-file table keyed by record id. Without a path it is memory-only.
pub struct JsonTable<R: Record> {
    path: Option<PathBuf>,
    inner: RwLock<Inner<R>>,
}

impl<R: Record> JsonTable<R> {
    /// Load from `path`; a missing file starts empty, an unreadable one is an error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records: Vec<R> = match tokio::fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => Vec::new(),
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let table = Self::with_records(Some(path), records);
        Ok(table)
    }

    pub fn in_memory() -> Self {
        Self::with_records(None, Vec::new())
    }

    fn with_records(path: Option<PathBuf>, records: Vec<R>) -> Self {
        let mut slots = BTreeMap::new();
        let mut next_seq = 0;
        for record in records {
            slots.insert(record.id().to_string(), Slot { seq: next_seq, record });
            next_seq += 1;
        }
        Self {
            path,
            inner: RwLock::new(Inner { slots, next_seq }),
        }
    }

    fn upsert(inner: &mut Inner<R>, record: R) {
        match inner.slots.get_mut(record.id()) {
            Some(slot) => slot.record = record,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.slots.insert(record.id().to_string(), Slot { seq, record });
            }
        }
    }

    fn ordered<'a>(slots: impl Iterator<Item = &'a Slot<R>>) -> Vec<R> {
        let mut v: Vec<&Slot<R>> = slots.collect();
        v.sort_by_key(|s| (s.record.created_at(), s.seq));
        v.into_iter().map(|s| s.record.clone()).collect()
    }

    /// Apply `change` to a copy of the table, write the copy and only then keep it, so a
    /// failed write leaves memory matching the file. `change` returns false when nothing changed.
    async fn mutate(
        &self,
        change: impl FnOnce(&mut Inner<R>) -> bool + Send,
    ) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        let mut next = g.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.save(&next).await?;
        *g = next;
        Ok(())
    }

    /// Rewrite the file (temp file + rename). Called with the write guard held so writes never interleave.
    async fn save(&self, inner: &Inner<R>) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let mut slots: Vec<&Slot<R>> = inner.slots.values().collect();
        slots.sort_by_key(|s| s.seq);
        let records: Vec<&R> = slots.into_iter().map(|s| &s.record).collect();
        let json = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl<R: Record> Table<R> for JsonTable<R> {
    async fn put(&self, record: R) -> Result<(), StoreError> {
        self.mutate(|inner| {
            Self::upsert(inner, record);
            true
        })
        .await
    }

    async fn put_many(&self, records: Vec<R>) -> Result<(), StoreError> {
        self.mutate(|inner| {
            for record in records {
                Self::upsert(inner, record);
            }
            true
        })
        .await
    }

    async fn get_all_by_thread(&self, thread_id: &str) -> Result<Vec<R>, StoreError> {
        let g = self.inner.read().await;
        Ok(Self::ordered(
            g.slots.values().filter(|s| s.record.thread_id() == thread_id),
        ))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| inner.slots.remove(id).is_some()).await
    }

    async fn delete_by_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let before = inner.slots.len();
            inner.slots.retain(|_, s| s.record.thread_id() != thread_id);
            inner.slots.len() != before
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<R>, StoreError> {
        let g = self.inner.read().await;
        Ok(Self::ordered(g.slots.values()))
    }
}
