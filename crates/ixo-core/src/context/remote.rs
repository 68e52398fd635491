//! Remote key-value context backend.
//!
//! Values live in a Redis-compatible server under the `ixo:ctx:` prefix
//! with server-side per-key expiry (`SET … PX`), so reads after TTL
//! observe absence without any client-side sweeping. Every failure maps
//! to [`ContextError::BackendUnavailable`]; the caller decides whether
//! that is fatal.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::debug;

use super::{serialize_checked, ContextError, StoreLimits, StoreSize};

/// Server-side namespace for all context keys.
const KEY_NAMESPACE: &str = "ixo:ctx:";

/// Batch size for `SCAN`-driven prefix clears.
const SCAN_COUNT: usize = 100;

/// Hard bound on SCAN iterations per clear, against a server that keeps
/// returning a nonzero cursor.
const MAX_SCAN_ROUNDS: usize = 10_000;

fn unavailable(e: &redis::RedisError) -> ContextError {
    ContextError::BackendUnavailable {
        reason: e.to_string(),
    }
}

/// Redis-backed store.
pub struct RemoteStore {
    limits: StoreLimits,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    /// Connects and verifies the server with a `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::BackendUnavailable`] on a malformed URL or
    /// unreachable server.
    pub async fn connect(url: &str, limits: StoreLimits) -> Result<Self, ContextError> {
        let client = redis::Client::open(url).map_err(|e| unavailable(&e))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable(&e))?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        debug!("remote context backend connected");
        Ok(Self { limits, conn })
    }

    /// The limits this store was constructed with.
    #[must_use]
    pub const fn limits(&self) -> StoreLimits {
        self.limits
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_NAMESPACE}{key}")
    }

    /// Reads a key. Expired keys are absent server-side.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::BackendUnavailable`] on transport failure
    /// and [`ContextError::Unserializable`] if the stored bytes are not
    /// JSON (which indicates a foreign writer in the namespace).
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, ContextError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(Self::namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        match raw {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ContextError::Unserializable {
                    reason: e.to_string(),
                }),
        }
    }

    /// Writes a key with per-key expiry.
    ///
    /// # Errors
    ///
    /// [`ContextError::PayloadTooLarge`] before any state change;
    /// [`ContextError::BackendUnavailable`] on transport failure.
    pub async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        let bytes = serialize_checked(value, self.limits.max_value_bytes)?;
        let ttl_ms = ttl.unwrap_or(self.limits.default_ttl).as_millis().max(1);
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(Self::namespaced(key))
            .arg(bytes)
            .arg("PX")
            .arg(u64::try_from(ttl_ms).unwrap_or(u64::MAX))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))
    }

    /// Deletes a key, reporting whether the server removed anything.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::BackendUnavailable`] on transport failure.
    pub async fn delete(&self, key: &str) -> Result<bool, ContextError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(Self::namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(removed > 0)
    }

    /// Entry count via a namespace scan. Resident bytes are not tracked
    /// remotely.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::BackendUnavailable`] on transport failure.
    pub async fn size(&self) -> Result<StoreSize, ContextError> {
        let keys = self.scan_keys(&format!("{KEY_NAMESPACE}*")).await?;
        Ok(StoreSize {
            entries: keys.len() as u64,
            bytes: None,
        })
    }

    /// Removes every key under the prefix. Returns the removal count.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::BackendUnavailable`] on transport failure.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<u64, ContextError> {
        let keys = self
            .scan_keys(&format!("{KEY_NAMESPACE}{prefix}*"))
            .await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut removed: u64 = 0;
        for batch in keys.chunks(SCAN_COUNT) {
            let mut cmd = redis::cmd("DEL");
            for key in batch {
                cmd.arg(key);
            }
            let n: u64 = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            removed = removed.saturating_add(n);
        }
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, ContextError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        for _ in 0..MAX_SCAN_ROUNDS {
            let (next, mut batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            keys.append(&mut batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
        Err(ContextError::BackendUnavailable {
            reason: format!("SCAN did not terminate within {MAX_SCAN_ROUNDS} rounds"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespacing() {
        assert_eq!(RemoteStore::namespaced("session:s:k"), "ixo:ctx:session:s:k");
    }

    #[tokio::test]
    async fn test_connect_failure_maps_to_backend_unavailable() {
        let err = RemoteStore::connect("redis://127.0.0.1:1/0", StoreLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_malformed_url_rejected() {
        let err = RemoteStore::connect("not-a-url", StoreLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::BackendUnavailable { .. }));
    }
}
