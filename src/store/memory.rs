//! In-process [`EventStore`] for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;

use super::EventStore;

#[derive(Debug, Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, String>,
}

/// Lists and values kept in memory behind a mutex.
///
/// Clones share the same data, so a test can hold one clone while the
/// server uses another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry to the tail of the list at `key`.
    pub fn push_back(&self, key: &str, entry: impl Into<String>) {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(entry.into());
    }

    /// Snapshot of the list at `key`, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    /// Keys of all stored values that start with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Make every operation fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory store marked unavailable");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn peek_head(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        Ok(self
            .lock()
            .lists
            .get(key)
            .and_then(|list| list.front().cloned()))
    }

    async fn pop_head(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        let mut inner = self.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let head = list.pop_front();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(head)
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.check_available()?;
        self.lock()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let store = MemoryStore::new();
        store.push_back("event-1", "a|1|1");
        store.push_back("event-1", "b|2|2");

        assert_eq!(store.peek_head("event-1").await.unwrap().as_deref(), Some("a|1|1"));
        assert_eq!(store.peek_head("event-1").await.unwrap().as_deref(), Some("a|1|1"));
        assert_eq!(store.list("event-1").len(), 2);
    }

    #[tokio::test]
    async fn test_pop_in_fifo_order() {
        let store = MemoryStore::new();
        store.push_back("event-1", "a");
        store.push_back("event-1", "b");

        assert_eq!(store.pop_head("event-1").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop_head("event-1").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop_head("event-1").await.unwrap(), None);
        assert_eq!(store.peek_head("event-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store.set("usage-1-100", "{}").await.unwrap();
        store.set("other", "x").await.unwrap();

        assert_eq!(store.get("usage-1-100").as_deref(), Some("{}"));
        assert_eq!(store.keys_with_prefix("usage-1-"), vec!["usage-1-100"]);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_operation() {
        let store = MemoryStore::new();
        store.push_back("event-1", "a");
        store.set_unavailable(true);

        assert!(store.peek_head("event-1").await.is_err());
        assert!(store.pop_head("event-1").await.is_err());
        assert!(store.set("k", "v").await.is_err());
        assert_eq!(store.list("event-1"), vec!["a"]);

        store.set_unavailable(false);
        assert!(store.pop_head("event-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let store = MemoryStore::new();
        let shared: Arc<dyn EventStore> = Arc::new(store.clone());
        store.push_back("event-9", "x");
        assert_eq!(shared.peek_head("event-9").await.unwrap().as_deref(), Some("x"));
    }
}
