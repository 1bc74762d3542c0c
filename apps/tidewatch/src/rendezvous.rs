//! Rendezvous cache: a key/value store where a read for a missing key
//! suspends until a matching write arrives. The upstream shard populates it
//! with enriched member/presence payloads; the HTTP collaborator awaits them
//! by subject id without caring whether the gateway has answered yet.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum RendezvousError {
    /// The key was deleted while readers were still suspended on it.
    #[error("rendezvous wait cancelled: key was deleted")]
    Cancelled,
}

#[derive(Default)]
struct Entry {
    value: Option<Value>,
    waiters: Vec<oneshot::Sender<Value>>,
}

#[derive(Default)]
pub struct RendezvousCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RendezvousCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve immediately when a value is stored, otherwise suspend until
    /// the next `set` for this key. Many concurrent readers may wait on one
    /// key; a single `set` resolves them all.
    pub async fn get(&self, key: &str) -> Result<Value, RendezvousError> {
        let rx = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_default();
            if let Some(value) = &entry.value {
                return Ok(value.clone());
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| RendezvousError::Cancelled)
    }

    /// Store (overwriting any prior value) and resolve every pending waiter.
    pub fn set(&self, key: &str, value: Value) {
        let waiters = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_string()).or_default();
            entry.value = Some(value.clone());
            std::mem::take(&mut entry.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }

    /// True only when a resolved value is present; suspended readers alone
    /// do not count.
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.value.is_some())
    }

    /// Remove the key. Dropping the waiter channels wakes any suspended
    /// readers with `RendezvousError::Cancelled` rather than leaving them
    /// hanging forever. Returns whether a resolved value was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.value.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_after_set_resolves_immediately() {
        let cache = RendezvousCache::new();
        cache.set("42", json!({ "status": "online" }));
        let value = cache.get("42").await.unwrap();
        assert_eq!(value["status"], "online");
    }

    #[tokio::test]
    async fn get_before_set_resolves_with_first_set() {
        let cache = Arc::new(RendezvousCache::new());

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("42").await })
        };
        tokio::task::yield_now().await;

        cache.set("42", json!(1));
        cache.set("42", json!(2));

        assert_eq!(reader.await.unwrap().unwrap(), json!(1));
        // Later reads observe the overwrite.
        assert_eq!(cache.get("42").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn one_set_resolves_all_waiters() {
        let cache = Arc::new(RendezvousCache::new());
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("7").await })
            })
            .collect();
        tokio::task::yield_now().await;

        cache.set("7", json!("idle"));
        for reader in readers {
            assert_eq!(reader.await.unwrap().unwrap(), json!("idle"));
        }
    }

    #[tokio::test]
    async fn delete_cancels_pending_waiters() {
        let cache = Arc::new(RendezvousCache::new());
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("gone").await })
        };
        tokio::task::yield_now().await;

        assert!(!cache.delete("gone")); // no resolved value existed
        assert!(matches!(
            reader.await.unwrap(),
            Err(RendezvousError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn has_and_delete_track_resolved_values_only() {
        let cache = RendezvousCache::new();
        assert!(!cache.has("1"));
        cache.set("1", json!(null));
        assert!(cache.has("1"));
        assert!(cache.delete("1"));
        assert!(!cache.has("1"));
    }
}
