use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::runner::error::QueueError;

/// Key-addressed FIFO lists backing the dispatcher.
///
/// Each call is expected to be atomic on its own; a `len` followed by a
/// `pop_front` is not.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append an entry to the tail of `key`.
    async fn push_back(&self, key: &str, entry: String) -> Result<(), QueueError>;

    /// Put an entry back at the head of `key`.
    async fn push_front(&self, key: &str, entry: String) -> Result<(), QueueError>;

    /// Remove and return the head of `key`, `None` when the list is empty.
    async fn pop_front(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Current depth of `key`.
    async fn len(&self, key: &str) -> Result<u64, QueueError>;
}

/// In-process store with the same list semantics as Redis.
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `QueueError::Store` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copy of the entries held under `key`, head first.
    pub async fn entries(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .await
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Store("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_back(&self, key: &str, entry: String) -> Result<(), QueueError> {
        self.check()?;
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push_back(entry);
        Ok(())
    }

    async fn push_front(&self, key: &str, entry: String) -> Result<(), QueueError> {
        self.check()?;
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push_front(entry);
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, QueueError> {
        self.check()?;
        let mut lists = self.lists.lock().await;
        let entry = lists.get_mut(key).and_then(VecDeque::pop_front);
        // Redis drops a list once it is empty
        if lists.get(key).is_some_and(VecDeque::is_empty) {
            lists.remove(key);
        }
        Ok(entry)
    }

    async fn len(&self, key: &str) -> Result<u64, QueueError> {
        self.check()?;
        Ok(self
            .lists
            .lock()
            .await
            .get(key)
            .map_or(0, |list| list.len() as u64))
    }
}
