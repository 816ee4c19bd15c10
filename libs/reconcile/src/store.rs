//! Key-value store contract and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors returned by store clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the connection broke.
    #[error("connection error: {0}")]
    Connection(String),

    /// The store sent something the client does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store rejected a command.
    #[error("server error: {0}")]
    Server(String),

    /// An atomic batch was discarded by the store.
    #[error("transaction aborted")]
    TransactionAborted,
}

/// One write in a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Ordered writes applied atomically by [`KvStore::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of `Set` operations.
    pub fn sets(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, BatchOp::Set { .. }))
            .count()
    }

    /// Number of `Delete` operations.
    pub fn deletes(&self) -> usize {
        self.len() - self.sets()
    }
}

/// Flat string-keyed store the downstream proxy reads its routes from.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Apply every operation of `batch`, in order, as one atomic unit.
    async fn apply(&self, batch: Batch) -> Result<(), StoreError>;

    /// Value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Every stored key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        batch.set(key, value);
        self.apply(batch).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        for key in keys {
            batch.delete(key.as_str());
        }
        self.apply(batch).await
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    batches: AtomicU64,
    prefix_scans: AtomicU64,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects every batch.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Seed entries without counting a batch.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        store
            .entries
            .lock()
            .unwrap()
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        store
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Copy of every stored entry.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.lock().unwrap().clone()
    }

    /// Entries whose key starts with `prefix`.
    pub fn entries_with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches applied so far.
    pub fn batches_applied(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Number of `keys_with_prefix` calls so far.
    pub fn prefix_scans(&self) -> u64 {
        self.prefix_scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn apply(&self, batch: Batch) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Connection("memory store configured to fail".into()));
        }

        let mut entries = self.entries.lock().unwrap();
        for op in batch.ops {
            match op {
                BatchOp::Set { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        let applied = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(batches = applied, entries = entries.len(), "[MEMORY] batch applied");

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(MemoryStore::get(self, key))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.prefix_scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries_with_prefix(prefix).into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.set("a", "1").delete("a").set("b", "2").set("b", "3");

        assert_eq!(batch.sets(), 3);
        assert_eq!(batch.deletes(), 1);

        store.apply(batch).await.unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b").as_deref(), Some("3"));
        assert_eq!(store.batches_applied(), 1);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = MemoryStore::with_entries([
            ("routes/api/1", "x"),
            ("routes/api/2", "y"),
            ("routes/apiv2/1", "z"),
            ("routes/web/1", "w"),
        ]);

        let keys = store.keys_with_prefix("routes/api/").await.unwrap();
        assert_eq!(keys, vec!["routes/api/1", "routes/api/2"]);
    }

    #[tokio::test]
    async fn test_set_and_delete_helpers() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));

        assert_eq!(KvStore::get(&store, "k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(KvStore::get(&store, "missing").await.unwrap(), None);

        store.delete(&["k".to_string()]).await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.batches_applied(), 2);
    }

    #[tokio::test]
    async fn test_failing_store_leaves_entries_untouched() {
        let store = MemoryStore::failing();
        let mut batch = Batch::new();
        batch.set("k", "v");

        assert!(store.apply(batch).await.is_err());
        assert!(store.is_empty());
    }
}
