//! Structured audit log.
//!
//! Audit events are line-delimited JSON records written by a dedicated
//! writer task. Emission goes through a bounded channel with `try_send`:
//! a full channel drops the event and bumps a counter rather than ever
//! suspending the request path.
//!
//! Every trace produces exactly one terminal record (`intent_complete` or
//! `intent_failed`); sandbox lifecycle transitions appear as non-terminal
//! records between them. The exactly-once discipline is the orchestrator's
//! responsibility; this module only transports records.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::redact;

/// Bound on queued-but-unwritten audit events.
pub const AUDIT_CHANNEL_CAPACITY: usize = 1024;

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Wall-clock time the event was created.
    pub timestamp: DateTime<Utc>,
    /// Event name, e.g. `intent_complete`, `sandbox_kill`.
    pub event: String,
    /// Per-call identifier linking telemetry, audit, and response metadata.
    pub trace_id: String,
    /// Session the call ran under, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Intent name, if the event is intent-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Outcome label (`completed`, `timed_out`, `unknown_intent`, ...).
    pub outcome: String,
    /// Free-form extra fields. String values are redacted before emission.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event: impl Into<String>, trace_id: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            trace_id: trace_id.into(),
            session_id: None,
            intent: None,
            outcome: outcome.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attaches a session id.
    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attaches an intent name.
    #[must_use]
    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    /// Attaches one extra field. String values are redacted.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let value = match value {
            serde_json::Value::String(s) => serde_json::Value::String(redact::redact(&s)),
            other => other,
        };
        self.fields.insert(key.into(), value);
        self
    }
}

enum SinkMsg {
    Event(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
}

/// Handle for emitting audit events.
///
/// Cheap to clone. Dropping every handle closes the channel and lets the
/// writer task drain and exit.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<SinkMsg>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AuditSink {
    /// Spawns the writer task and returns the emission handle.
    ///
    /// With `path = None`, records are written to the `audit` tracing
    /// target instead of a file. Must be called from within a tokio
    /// runtime.
    #[must_use]
    pub fn spawn(path: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
        tokio::spawn(writer_task(path, rx));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emits an event without blocking.
    ///
    /// Returns `false` when the channel was full and the event was
    /// dropped; the caller is expected to bump the drop counter metric.
    pub fn emit(&self, event: AuditEvent) -> bool {
        match self.tx.try_send(SinkMsg::Event(Box::new(event))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of events dropped so far because the channel was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits until every event emitted before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SinkMsg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn writer_task(path: Option<PathBuf>, mut rx: mpsc::Receiver<SinkMsg>) {
    let mut file = match &path {
        Some(p) => {
            if let Some(parent) = p.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "audit sink unavailable, falling back to tracing");
                    None
                }
            }
        }
        None => None,
    };

    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMsg::Event(event) => {
                let Ok(mut line) = serde_json::to_string(&*event) else {
                    debug!("unserializable audit event skipped");
                    continue;
                };
                line.push('\n');
                match file.as_mut() {
                    Some(f) => {
                        if let Err(e) = f.write_all(line.as_bytes()).await {
                            warn!(error = %e, "audit write failed");
                        }
                    }
                    None => {
                        tracing::info!(target: "audit", record = %line.trim_end());
                    }
                }
            }
            SinkMsg::Flush(ack) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush().await;
                }
                let _ = ack.send(());
            }
        }
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_written_as_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = AuditSink::spawn(Some(path.clone()));

        sink.emit(
            AuditEvent::new("intent_complete", "trace-1", "completed")
                .intent("echo")
                .session("s-1")
                .field("exit_code", serde_json::json!(0)),
        );
        sink.emit(AuditEvent::new("intent_failed", "trace-2", "unknown_intent"));
        sink.flush().await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, "intent_complete");
        assert_eq!(first.trace_id, "trace-1");
        assert_eq!(first.intent.as_deref(), Some("echo"));
        assert_eq!(first.outcome, "completed");

        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.outcome, "unknown_intent");
        assert!(second.session_id.is_none());
    }

    #[tokio::test]
    async fn test_string_fields_are_redacted() {
        let event = AuditEvent::new("sandbox_exit", "t", "completed").field(
            "stderr_head",
            serde_json::json!("api_key=sk_live_0123456789abcdef012345 trailing"),
        );
        let rendered = serde_json::to_string(&event).unwrap();
        assert!(!rendered.contains("sk_live_0123456789abcdef012345"));
        assert!(rendered.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_dropped_counter_without_writer_backpressure() {
        let sink = AuditSink::spawn(None);
        assert_eq!(sink.dropped_count(), 0);
        sink.emit(AuditEvent::new("x", "t", "ok"));
        sink.flush().await;
    }
}
