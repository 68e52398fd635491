//! Bounded, TTL-governed context store.
//!
//! A mapping from string keys to JSON values shared across sessions. Two
//! backends sit behind one operation surface, selected at construction as
//! a variant type so the choice is closed and checkable:
//!
//! - [`MemoryStore`]: mutex-guarded map, LRU eviction, TTL checked on read.
//! - [`RemoteStore`]: Redis with server-side per-key expiry.
//!
//! # Invariants
//!
//! - Reads after TTL expiry return absent.
//! - A write larger than the per-value ceiling fails with
//!   `payload_too_large` before any state change.
//! - `clear_session` removes every key under the session prefix and is
//!   idempotent.
//! - Per-key operations are logically atomic; across keys no global order
//!   is promised.

mod memory;
mod remote;

use std::time::Duration;

use thiserror::Error;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// Limits applied identically by every backend.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Per-value size ceiling in serialized bytes.
    pub max_value_bytes: usize,
    /// Memory ceiling for the in-process backend; LRU eviction keeps the
    /// resident total under this. Ignored by the remote backend.
    pub max_total_bytes: usize,
    /// TTL applied when a write does not carry its own.
    pub default_ttl: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_value_bytes: crate::config::DEFAULT_CONTEXT_SIZE_LIMIT_BYTES,
            max_total_bytes: 64 * (1 << 20),
            default_ttl: Duration::from_secs(crate::config::DEFAULT_CACHE_TTL_SECONDS),
        }
    }
}

/// Entry count and resident size of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSize {
    /// Number of live entries.
    pub entries: u64,
    /// Resident bytes, when the backend can account for them.
    pub bytes: Option<u64>,
}

/// Context store failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// The serialized value exceeds the per-value ceiling. The store is
    /// unchanged.
    #[error("value of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Serialized size of the rejected value.
        size: usize,
        /// The configured ceiling.
        max: usize,
    },

    /// The write would push the session's summed size past its budget.
    /// The store is unchanged.
    #[error(
        "session {session} holds {current} bytes and cannot accept {incoming} more (budget {budget})"
    )]
    SessionBudgetExceeded {
        /// The session whose budget would be exceeded.
        session: String,
        /// Bytes currently attributed to the session.
        current: u64,
        /// Serialized size of the rejected write.
        incoming: u64,
        /// The configured per-session ceiling.
        budget: u64,
    },

    /// The remote backend is unreachable or returned a protocol error.
    #[error("context backend unavailable: {reason}")]
    BackendUnavailable {
        /// Underlying failure, stringified.
        reason: String,
    },

    /// The value cannot be serialized to JSON.
    #[error("value is not JSON-serializable: {reason}")]
    Unserializable {
        /// Underlying failure, stringified.
        reason: String,
    },
}

/// Returns the keyspace prefix for a session.
#[must_use]
pub fn session_prefix(session_id: &str) -> String {
    format!("session:{session_id}:")
}

/// The pluggable context store.
///
/// A closed variant type rather than open dispatch, so construction-time
/// policy (backend selection, limits) is enforceable in one place.
#[derive(Debug)]
pub enum ContextStore {
    /// In-process backend.
    Memory(MemoryStore),
    /// Remote key-value backend.
    Remote(RemoteStore),
}

impl ContextStore {
    /// Constructs the in-process backend.
    #[must_use]
    pub fn memory(limits: StoreLimits) -> Self {
        Self::Memory(MemoryStore::new(limits))
    }

    /// Connects the remote backend.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::BackendUnavailable`] when the URL is
    /// malformed or the server cannot be reached.
    pub async fn remote(url: &str, limits: StoreLimits) -> Result<Self, ContextError> {
        Ok(Self::Remote(RemoteStore::connect(url, limits).await?))
    }

    /// Reads a key. Absent and expired keys both return `None`.
    ///
    /// # Errors
    ///
    /// Remote backend failures surface as
    /// [`ContextError::BackendUnavailable`].
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, ContextError> {
        match self {
            Self::Memory(s) => Ok(s.get(key).await),
            Self::Remote(s) => s.get(key).await,
        }
    }

    /// Writes a key with the given TTL (backend default when `None`).
    ///
    /// # Errors
    ///
    /// [`ContextError::PayloadTooLarge`] when the serialized value exceeds
    /// the ceiling - checked before any state change. Remote failures
    /// surface as [`ContextError::BackendUnavailable`].
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        match self {
            Self::Memory(s) => s.set(key, value, ttl).await,
            Self::Remote(s) => s.set(key, &value, ttl).await,
        }
    }

    /// Deletes a key, reporting whether it was present.
    ///
    /// # Errors
    ///
    /// Remote backend failures surface as
    /// [`ContextError::BackendUnavailable`].
    pub async fn delete(&self, key: &str) -> Result<bool, ContextError> {
        match self {
            Self::Memory(s) => Ok(s.delete(key).await),
            Self::Remote(s) => s.delete(key).await,
        }
    }

    /// Entry count and resident size.
    ///
    /// # Errors
    ///
    /// Remote backend failures surface as
    /// [`ContextError::BackendUnavailable`].
    pub async fn size(&self) -> Result<StoreSize, ContextError> {
        match self {
            Self::Memory(s) => Ok(s.size().await),
            Self::Remote(s) => s.size().await,
        }
    }

    /// Removes every key under the session's prefix. Idempotent; returns
    /// the number of keys removed.
    ///
    /// # Errors
    ///
    /// Remote backend failures surface as
    /// [`ContextError::BackendUnavailable`].
    pub async fn clear_session(&self, session_id: &str) -> Result<u64, ContextError> {
        match self {
            Self::Memory(s) => Ok(s.clear_prefix(&session_prefix(session_id)).await),
            Self::Remote(s) => s.clear_prefix(&session_prefix(session_id)).await,
        }
    }

    /// Drops expired entries eagerly. The remote backend expires
    /// server-side, so this is a no-op there.
    pub async fn purge_expired(&self) -> u64 {
        match self {
            Self::Memory(s) => s.purge_expired().await,
            Self::Remote(_) => 0,
        }
    }

    /// The limits this store was constructed with.
    #[must_use]
    pub fn limits(&self) -> StoreLimits {
        match self {
            Self::Memory(s) => s.limits(),
            Self::Remote(s) => s.limits(),
        }
    }
}

/// Serializes a value and checks it against the per-value ceiling.
///
/// Shared by both backends so the pre-state-change check is identical.
pub(crate) fn serialize_checked(
    value: &serde_json::Value,
    max: usize,
) -> Result<Vec<u8>, ContextError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ContextError::Unserializable {
        reason: e.to_string(),
    })?;
    if bytes.len() > max {
        return Err(ContextError::PayloadTooLarge {
            size: bytes.len(),
            max,
        });
    }
    Ok(bytes)
}
