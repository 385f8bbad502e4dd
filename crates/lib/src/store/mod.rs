//! Durable key-value persistence for chat messages and the offline outbox.
//!
//! Each table is keyed by record id and queryable by thread. The file-backed
//! [`JsonTable`] keeps the whole table in memory and rewrites its JSON file on
//! every mutation; a data directory is guarded by an exclusive lock file so
//! two clients never write the same tables.

mod json;
mod records;

pub use json::JsonTable;
pub use records::{OutboxEntry, PersistedMessage};

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MESSAGES_FILE: &str = "messages.json";
const OUTBOX_FILE: &str = "outbox.json";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("data directory {0} is in use by another client")]
    Locked(PathBuf),
}

/// A persisted record: keyed by id, indexed by thread and creation time.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn thread_id(&self) -> &str;
    fn created_at(&self) -> i64;
}

/// One independently keyed table (messages or outbox).
#[async_trait]
pub trait Table<R: Record>: Send + Sync {
    /// Insert or replace by id.
    async fn put(&self, record: R) -> Result<(), StoreError>;
    /// Insert or replace several records in one write.
    async fn put_many(&self, records: Vec<R>) -> Result<(), StoreError>;
    /// Records of one thread, ordered by creation time.
    async fn get_all_by_thread(&self, thread_id: &str) -> Result<Vec<R>, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn delete_by_thread(&self, thread_id: &str) -> Result<(), StoreError>;
    /// Every record, ordered by creation time.
    async fn list_all(&self) -> Result<Vec<R>, StoreError>;
}

/// Message table plus outbox table, opened together from one data directory.
#[derive(Clone)]
pub struct Store {
    pub messages: Arc<dyn Table<PersistedMessage>>,
    pub outbox: Arc<dyn Table<OutboxEntry>>,
    _lock: Option<Arc<std::fs::File>>,
}

impl Store {
    /// Open (or create) the tables under `dir`, taking the directory lock.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let Some(lock) = lock_dir(dir.join(LOCK_FILE)).await? else {
            return Err(StoreError::Locked(dir.to_path_buf()));
        };
        let messages = JsonTable::<PersistedMessage>::load(dir.join(MESSAGES_FILE)).await?;
        let outbox = JsonTable::<OutboxEntry>::load(dir.join(OUTBOX_FILE)).await?;
        log::debug!("store: opened {}", dir.display());
        Ok(Self {
            messages: Arc::new(messages),
            outbox: Arc::new(outbox),
            _lock: Some(Arc::new(lock)),
        })
    }

    /// Tables that live only in memory (nothing survives the process).
    pub fn in_memory() -> Self {
        Self {
            messages: Arc::new(JsonTable::in_memory()),
            outbox: Arc::new(JsonTable::in_memory()),
            _lock: None,
        }
    }
}

/// Open the lock file and try to take it exclusively; `None` when another client holds it.
/// fs2 only offers blocking calls, so this runs on the blocking pool.
async fn lock_dir(path: PathBuf) -> Result<Option<std::fs::File>, StoreError> {
    let locked = tokio::task::spawn_blocking(move || -> std::io::Result<Option<std::fs::File>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Ok(file.try_lock_exclusive().is_ok().then_some(file))
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(locked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("parley-store-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn second_open_of_same_directory_is_refused() {
        let dir = temp_dir();
        let _first = Store::open(&dir).await.expect("open store");
        match Store::open(&dir).await {
            Err(StoreError::Locked(p)) => assert_eq!(p, dir),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second open should be refused"),
        }
    }
}
