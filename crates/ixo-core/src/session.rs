//! Session registry: named keyspaces over the context store.
//!
//! A session is a prefix (`session:{id}:`) plus a TTL record. Creation is
//! implicit on first write; explicit close removes the whole prefix and
//! is idempotent. A session has no state machine beyond active/expired.
//!
//! The registry owns the per-session budget: every write is checked
//! against the summed serialized size of the session's entries before the
//! store is touched, so one session cannot grow past its ceiling no
//! matter how small each individual value is. Per-key sizes live in the
//! registry's bookkeeping map, which also feeds the active-session gauge
//! and the per-session usage gauges without scanning the store.
//!
//! The size ledger is conservative: an entry that expires in the store
//! keeps its bytes attributed to the session until the key is rewritten,
//! deleted, or the session closes. A budget can only be over-counted,
//! never under-counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::DEFAULT_PER_SESSION_BUDGET_BYTES;
use crate::context::{session_prefix, ContextError, ContextStore};
use crate::telemetry::Metrics;

/// Default session lifetime (1 hour).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Upper bound on concurrently tracked sessions. The oldest session is
/// closed when a create would exceed it.
pub const MAX_SESSIONS: usize = 1024;

/// Entry count and summed serialized bytes of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Number of keys attributed to the session.
    pub entries: usize,
    /// Summed serialized size of those keys' values.
    pub bytes: u64,
}

#[derive(Debug, Clone)]
struct SessionMeta {
    created: Instant,
    ttl: Duration,
    /// Serialized size per key (unprefixed), the session's size ledger.
    entry_sizes: HashMap<String, u64>,
}

impl SessionMeta {
    fn new(created: Instant, ttl: Duration) -> Self {
        Self {
            created,
            ttl,
            entry_sizes: HashMap::new(),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= self.ttl
    }

    fn total_bytes(&self) -> u64 {
        self.entry_sizes.values().sum()
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            entries: self.entry_sizes.len(),
            bytes: self.total_bytes(),
        }
    }
}

/// Registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    store: Arc<ContextStore>,
    metrics: Arc<Metrics>,
    default_ttl: Duration,
    budget_bytes: u64,
    sessions: Mutex<HashMap<String, SessionMeta>>,
}

impl SessionRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(store: Arc<ContextStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            default_ttl: DEFAULT_SESSION_TTL,
            budget_bytes: DEFAULT_PER_SESSION_BUDGET_BYTES,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the default session TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Overrides the per-session byte budget.
    #[must_use]
    pub const fn with_budget(mut self, budget_bytes: u64) -> Self {
        self.budget_bytes = budget_bytes;
        self
    }

    /// Creates a session with a fresh id.
    pub async fn create(&self, ttl: Option<Duration>) -> String {
        let id = Uuid::new_v4().to_string();
        self.register(&id, ttl).await;
        id
    }

    /// Ensures a session id is tracked, creating it implicitly. Returns
    /// `true` when this call created it.
    pub async fn ensure(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        if let Some(meta) = sessions.get(session_id) {
            if !meta.expired(now) {
                return false;
            }
            // Expired but unswept: refresh in place, the gauge already
            // counts it.
            sessions.insert(
                session_id.to_string(),
                SessionMeta::new(now, self.default_ttl),
            );
            return true;
        }
        sessions.insert(
            session_id.to_string(),
            SessionMeta::new(now, self.default_ttl),
        );
        drop(sessions);
        self.metrics.sessions_delta(1);
        true
    }

    async fn register(&self, session_id: &str, ttl: Option<Duration>) {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= MAX_SESSIONS {
            // Close the oldest session to stay bounded.
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, m)| m.created)
                .map(|(k, _)| k.clone())
            {
                sessions.remove(&oldest);
                drop(sessions);
                let _ = self.store.clear_session(&oldest).await;
                self.metrics.sessions_delta(-1);
                self.metrics.session_usage_remove(&oldest);
                sessions = self.sessions.lock().await;
            }
        }
        sessions.insert(
            session_id.to_string(),
            SessionMeta::new(Instant::now(), ttl.unwrap_or(self.default_ttl)),
        );
        drop(sessions);
        self.metrics.sessions_delta(1);
    }

    /// Whether a session is currently active.
    pub async fn is_active(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .is_some_and(|m| !m.expired(Instant::now()))
    }

    /// Entry count and byte usage for a session, `None` when untracked.
    pub async fn stats(&self, session_id: &str) -> Option<SessionStats> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(SessionMeta::stats)
    }

    /// Writes a key inside the session's namespace, creating the session
    /// implicitly.
    ///
    /// The write is checked against the per-session budget before the
    /// store is touched: the session's summed size plus this value
    /// (minus any value it replaces) must stay at or under the budget.
    /// The bookkeeping lock is held across the store write so the
    /// check-then-write is atomic with respect to other writers in the
    /// same session.
    ///
    /// # Errors
    ///
    /// [`ContextError::SessionBudgetExceeded`] when the write would push
    /// the session past its budget, with no state changed. Store
    /// failures (`payload_too_large`, `backend_unavailable`) propagate.
    pub async fn set(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        let incoming = serde_json::to_vec(&value)
            .map_err(|e| ContextError::Unserializable {
                reason: e.to_string(),
            })?
            .len() as u64;

        self.ensure(session_id).await;
        let mut sessions = self.sessions.lock().await;
        // Re-insert if a concurrent eviction raced the ensure above.
        let meta = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionMeta::new(Instant::now(), self.default_ttl));

        let replaced = meta.entry_sizes.get(key).copied().unwrap_or(0);
        let projected = meta.total_bytes() - replaced + incoming;
        if projected > self.budget_bytes {
            return Err(ContextError::SessionBudgetExceeded {
                session: session_id.to_string(),
                current: meta.total_bytes(),
                incoming,
                budget: self.budget_bytes,
            });
        }

        let scoped = format!("{}{key}", session_prefix(session_id));
        self.store.set(&scoped, value, ttl).await?;
        meta.entry_sizes.insert(key.to_string(), incoming);
        let stats = meta.stats();
        drop(sessions);
        self.metrics
            .session_usage_set(session_id, stats.entries, stats.bytes);
        Ok(())
    }

    /// Reads a key from the session's namespace.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get(
        &self,
        session_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ContextError> {
        let scoped = format!("{}{key}", session_prefix(session_id));
        self.store.get(&scoped).await
    }

    /// Deletes a key from the session's namespace, releasing its budget
    /// attribution.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delete(&self, session_id: &str, key: &str) -> Result<bool, ContextError> {
        let scoped = format!("{}{key}", session_prefix(session_id));
        let removed = self.store.delete(&scoped).await?;
        let mut sessions = self.sessions.lock().await;
        if let Some(meta) = sessions.get_mut(session_id) {
            meta.entry_sizes.remove(key);
            let stats = meta.stats();
            drop(sessions);
            self.metrics
                .session_usage_set(session_id, stats.entries, stats.bytes);
        }
        Ok(removed)
    }

    /// Closes a session: drops bookkeeping, clears its gauges, and
    /// removes every key under its prefix. Idempotent; returns the number
    /// of keys removed.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Bookkeeping is already adjusted when a
    /// store failure surfaces; a retry of `close` remains safe.
    pub async fn close(&self, session_id: &str) -> Result<u64, ContextError> {
        let was_tracked = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id).is_some()
        };
        if was_tracked {
            self.metrics.sessions_delta(-1);
            self.metrics.session_usage_remove(session_id);
        }
        self.store.clear_session(session_id).await
    }

    /// Drops expired sessions from bookkeeping and clears their prefixes.
    /// Returns the number of sessions expired.
    pub async fn sweep(&self) -> u64 {
        let now = Instant::now();
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, m)| m.expired(now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut count = 0;
        for id in expired {
            let removed = {
                let mut sessions = self.sessions.lock().await;
                sessions.remove(&id).is_some()
            };
            if removed {
                self.metrics.sessions_delta(-1);
                self.metrics.session_usage_remove(&id);
                let _ = self.store.clear_session(&id).await;
                count += 1;
            }
        }
        count
    }

    /// Number of tracked (not necessarily live) sessions.
    pub async fn tracked(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
