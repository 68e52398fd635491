//! In-process context backend.
//!
//! A mutex-guarded map with TTL checked on read and least-recently-used
//! eviction when the resident total crosses the memory ceiling. Eviction
//! scans for the oldest access stamp; the map is bounded by the ceiling,
//! so the scan is bounded too.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{serialize_checked, ContextError, StoreLimits, StoreSize};

#[derive(Debug)]
struct Entry {
    value: serde_json::Value,
    size: usize,
    created: Instant,
    ttl: Duration,
    last_used: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, Entry>,
    total_bytes: usize,
}

/// Mutex-guarded in-process store.
#[derive(Debug)]
pub struct MemoryStore {
    limits: StoreLimits,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store with the given limits.
    #[must_use]
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The limits this store was constructed with.
    #[must_use]
    pub const fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Reads a key, treating expired entries as absent (and dropping
    /// them). A live read refreshes the LRU stamp.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let expired = match inner.map.get(key) {
            None => return None,
            Some(e) => e.expired(now),
        };
        if expired {
            if let Some(e) = inner.map.remove(key) {
                inner.total_bytes -= e.size;
            }
            return None;
        }
        let entry = inner.map.get_mut(key)?;
        entry.last_used = now;
        Some(entry.value.clone())
    }

    /// Writes a key. The size check happens before any state change; a
    /// rejected write leaves any previous value intact.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        let bytes = serialize_checked(&value, self.limits.max_value_bytes)?;
        let size = bytes.len();
        let now = Instant::now();

        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.map.remove(key) {
            inner.total_bytes -= old.size;
        }
        inner.map.insert(
            key.to_string(),
            Entry {
                value,
                size,
                created: now,
                ttl: ttl.unwrap_or(self.limits.default_ttl),
                last_used: now,
            },
        );
        inner.total_bytes += size;
        self.evict_to_ceiling(&mut inner, key);
        Ok(())
    }

    /// Deletes a key, reporting whether it was present and live.
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.map.remove(key) {
            Some(e) => {
                inner.total_bytes -= e.size;
                !e.expired(Instant::now())
            }
            None => false,
        }
    }

    /// Live entry count and resident bytes. Expired-but-unswept entries
    /// are excluded from the count.
    pub async fn size(&self) -> StoreSize {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let entries = inner.map.values().filter(|e| !e.expired(now)).count() as u64;
        StoreSize {
            entries,
            bytes: Some(inner.total_bytes as u64),
        }
    }

    /// Removes every key with the given prefix. Returns the removal count.
    pub async fn clear_prefix(&self, prefix: &str) -> u64 {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some(e) = inner.map.remove(&key) {
                inner.total_bytes -= e.size;
                removed += 1;
            }
        }
        removed
    }

    /// Drops every expired entry. Returns the number dropped.
    pub async fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut purged = 0;
        for key in keys {
            if let Some(e) = inner.map.remove(&key) {
                inner.total_bytes -= e.size;
                purged += 1;
            }
        }
        purged
    }

    /// Evicts least-recently-used entries until the resident total is at
    /// or under the ceiling. The just-written key is exempt so a write can
    /// never evict itself into a lost update.
    fn evict_to_ceiling(&self, inner: &mut Inner, just_written: &str) {
        while inner.total_bytes > self.limits.max_total_bytes {
            let victim = inner
                .map
                .iter()
                .filter(|(k, _)| k.as_str() != just_written)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(e) = inner.map.remove(&victim) {
                inner.total_bytes -= e.size;
                debug!(key = %victim, "evicted least-recently-used context entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> StoreLimits {
        StoreLimits {
            max_value_bytes: 64,
            max_total_bytes: 160,
            default_ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStore::new(small_limits());
        store
            .set("k", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        assert_eq!(store.get("k").await, Some(serde_json::json!({"a": 1})));
        assert!(store.delete("k").await);
        assert_eq!(store.get("k").await, None);
        assert!(!store.delete("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_ttl_is_absent() {
        let store = MemoryStore::new(small_limits());
        store
            .set("k", serde_json::json!(1), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.get("k").await, Some(serde_json::json!(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn test_oversize_write_leaves_store_unchanged() {
        let store = MemoryStore::new(small_limits());
        store.set("k", serde_json::json!("old"), None).await.unwrap();

        let big = serde_json::json!("y".repeat(200));
        let err = store.set("k", big, None).await.unwrap_err();
        assert!(matches!(err, ContextError::PayloadTooLarge { .. }));

        // Prior value preserved.
        assert_eq!(store.get("k").await, Some(serde_json::json!("old")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_under_ceiling() {
        let store = MemoryStore::new(small_limits());
        // ~42 bytes each; ceiling 160 holds three. Distinct access
        // stamps via the paused clock.
        for key in ["a", "b", "c"] {
            store
                .set(key, serde_json::json!("v".repeat(40)), None)
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        // Touch "a" so "b" is the least recently used.
        let _ = store.get("a").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        store
            .set("d", serde_json::json!("v".repeat(40)), None)
            .await
            .unwrap();

        assert!(store.get("b").await.is_none());
        assert!(store.get("a").await.is_some());
        assert!(store.get("d").await.is_some());
    }

    #[tokio::test]
    async fn test_clear_prefix_idempotent() {
        let store = MemoryStore::new(small_limits());
        store
            .set("session:s1:a", serde_json::json!(1), None)
            .await
            .unwrap();
        store
            .set("session:s1:b", serde_json::json!(2), None)
            .await
            .unwrap();
        store
            .set("session:s2:a", serde_json::json!(3), None)
            .await
            .unwrap();

        assert_eq!(store.clear_prefix("session:s1:").await, 2);
        assert_eq!(store.clear_prefix("session:s1:").await, 0);
        assert!(store.get("session:s2:a").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new(small_limits());
        store
            .set("short", serde_json::json!(1), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store
            .set("long", serde_json::json!(2), Some(Duration::from_secs(100)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.size().await.entries, 1);
    }
}
