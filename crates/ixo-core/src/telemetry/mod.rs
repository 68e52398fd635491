//! Prometheus metrics for the orchestrator and sandbox.
//!
//! All metric families are registered once in [`Metrics::new`]; emission
//! after that point is lock-free interior mutability and never suspends a
//! request path. The registry is exported in Prometheus text format for a
//! pull-based scrape endpoint.
//!
//! # Metric Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `ixo_intents_total` | Counter | `mode`, `outcome` |
//! | `ixo_cache_hits_total` | Counter | - |
//! | `ixo_cache_misses_total` | Counter | - |
//! | `ixo_timed_out_total` | Counter | - |
//! | `ixo_resource_exceeded_total` | Counter | `kind` |
//! | `ixo_sandbox_rejections_total` | Counter | `reason` |
//! | `ixo_token_limit_exceeded_total` | Counter | - |
//! | `ixo_fallbacks_total` | Counter | - |
//! | `ixo_overload_rejections_total` | Counter | - |
//! | `ixo_audit_drops_total` | Counter | - |
//! | `ixo_execution_duration_seconds` | Histogram | `mode` |
//! | `ixo_tokens_used` | Histogram | - |
//! | `ixo_output_bytes` | Histogram | `stream` |
//! | `ixo_active_sessions` | Gauge | - |
//! | `ixo_active_containers` | Gauge | - |
//! | `ixo_pool_idle` | Gauge | - |
//! | `ixo_session_entries` | Gauge | `session_id` |
//! | `ixo_session_bytes` | Gauge | `session_id` |
//!
//! The per-session gauges are removed when a session closes or expires,
//! so their cardinality tracks the live session set.

pub mod audit;
pub mod redact;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use thiserror::Error;

pub use audit::{AuditEvent, AuditSink};

/// Maximum length for label values. Longer values are truncated so an
/// attacker-controlled intent name cannot blow up cardinality tooling.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for execution latency in seconds.
pub const EXECUTION_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Buckets for estimated token counts.
pub const TOKENS_USED_BUCKETS: &[f64] = &[10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0];

/// Buckets for captured output sizes in bytes.
pub const OUTPUT_BYTES_BUCKETS: &[f64] =
    &[256.0, 4096.0, 65536.0, 262_144.0, 1_048_576.0, 4_194_304.0];

/// Errors from metrics registration or export.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A family failed to register (duplicate name).
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Text encoding failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// The process-wide metrics handle.
///
/// Cheap to clone; all families use interior mutability and are safe to
/// share across tasks. Constructed once before any request is served.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    intents_total: IntCounterVec,
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    timed_out_total: IntCounter,
    resource_exceeded_total: IntCounterVec,
    sandbox_rejections_total: IntCounterVec,
    token_limit_exceeded_total: IntCounter,
    fallbacks_total: IntCounter,
    overload_rejections_total: IntCounter,
    audit_drops_total: IntCounter,

    execution_duration_seconds: HistogramVec,
    tokens_used: prometheus::Histogram,
    output_bytes: HistogramVec,

    active_sessions: IntGauge,
    active_containers: IntGauge,
    pool_idle: IntGauge,
    session_entries: IntGaugeVec,
    session_bytes: IntGaugeVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates the handle and registers every family with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] on a duplicate family
    /// name, which indicates a second construction in the same registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let intents_total = IntCounterVec::new(
            Opts::new("ixo_intents_total", "Intent executions by mode and outcome"),
            &["mode", "outcome"],
        )?;
        let cache_hits_total =
            IntCounter::new("ixo_cache_hits_total", "Response cache hits")?;
        let cache_misses_total =
            IntCounter::new("ixo_cache_misses_total", "Response cache misses")?;
        let timed_out_total =
            IntCounter::new("ixo_timed_out_total", "Executions killed by the wall clock")?;
        let resource_exceeded_total = IntCounterVec::new(
            Opts::new(
                "ixo_resource_exceeded_total",
                "Executions killed by a resource controller",
            ),
            &["kind"],
        )?;
        let sandbox_rejections_total = IntCounterVec::new(
            Opts::new("ixo_sandbox_rejections_total", "Programs refused by the sandbox"),
            &["reason"],
        )?;
        let token_limit_exceeded_total = IntCounter::new(
            "ixo_token_limit_exceeded_total",
            "Requests over the token budget",
        )?;
        let fallbacks_total = IntCounter::new(
            "ixo_fallbacks_total",
            "Hybrid-mode fallbacks to the protocol collaborator",
        )?;
        let overload_rejections_total = IntCounter::new(
            "ixo_overload_rejections_total",
            "Requests rejected by admission control",
        )?;
        let audit_drops_total = IntCounter::new(
            "ixo_audit_drops_total",
            "Audit events dropped because the sink channel was full",
        )?;

        let execution_duration_seconds = HistogramVec::new(
            HistogramOpts::new("ixo_execution_duration_seconds", "End-to-end request latency")
                .buckets(EXECUTION_DURATION_BUCKETS.to_vec()),
            &["mode"],
        )?;
        let tokens_used = prometheus::Histogram::with_opts(
            HistogramOpts::new("ixo_tokens_used", "Estimated tokens per request")
                .buckets(TOKENS_USED_BUCKETS.to_vec()),
        )?;
        let output_bytes = HistogramVec::new(
            HistogramOpts::new("ixo_output_bytes", "Captured output bytes per stream")
                .buckets(OUTPUT_BYTES_BUCKETS.to_vec()),
            &["stream"],
        )?;

        let active_sessions = IntGauge::new("ixo_active_sessions", "Currently active sessions")?;
        let active_containers =
            IntGauge::new("ixo_active_containers", "Containers currently running")?;
        let pool_idle = IntGauge::new("ixo_pool_idle", "Idle containers in the pool")?;
        let session_entries = IntGaugeVec::new(
            Opts::new("ixo_session_entries", "Live entries per session"),
            &["session_id"],
        )?;
        let session_bytes = IntGaugeVec::new(
            Opts::new("ixo_session_bytes", "Summed entry bytes per session"),
            &["session_id"],
        )?;

        registry.register(Box::new(intents_total.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(timed_out_total.clone()))?;
        registry.register(Box::new(resource_exceeded_total.clone()))?;
        registry.register(Box::new(sandbox_rejections_total.clone()))?;
        registry.register(Box::new(token_limit_exceeded_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(overload_rejections_total.clone()))?;
        registry.register(Box::new(audit_drops_total.clone()))?;
        registry.register(Box::new(execution_duration_seconds.clone()))?;
        registry.register(Box::new(tokens_used.clone()))?;
        registry.register(Box::new(output_bytes.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(active_containers.clone()))?;
        registry.register(Box::new(pool_idle.clone()))?;
        registry.register(Box::new(session_entries.clone()))?;
        registry.register(Box::new(session_bytes.clone()))?;

        Ok(Self {
            registry,
            intents_total,
            cache_hits_total,
            cache_misses_total,
            timed_out_total,
            resource_exceeded_total,
            sandbox_rejections_total,
            token_limit_exceeded_total,
            fallbacks_total,
            overload_rejections_total,
            audit_drops_total,
            execution_duration_seconds,
            tokens_used,
            output_bytes,
            active_sessions,
            active_containers,
            pool_idle,
            session_entries,
            session_bytes,
        })
    }

    /// Records a finished intent with its mode and outcome labels.
    pub fn intent_finished(&self, mode: &str, outcome: &str) {
        self.intents_total
            .with_label_values(&[truncate(mode), truncate(outcome)])
            .inc();
    }

    /// Records a response-cache hit or miss.
    pub fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits_total.inc();
        } else {
            self.cache_misses_total.inc();
        }
    }

    /// Records a wall-clock kill.
    pub fn timed_out(&self) {
        self.timed_out_total.inc();
    }

    /// Records a resource-controller kill (`memory` or `processes`).
    pub fn resource_exceeded(&self, kind: &str) {
        self.resource_exceeded_total
            .with_label_values(&[truncate(kind)])
            .inc();
    }

    /// Records a sandbox refusal.
    pub fn sandbox_rejected(&self, reason: &str) {
        self.sandbox_rejections_total
            .with_label_values(&[truncate(reason)])
            .inc();
    }

    /// Records a request over the token budget.
    pub fn token_limit_exceeded(&self) {
        self.token_limit_exceeded_total.inc();
    }

    /// Records a hybrid-mode fallback.
    pub fn fallback(&self) {
        self.fallbacks_total.inc();
    }

    /// Records an admission-control rejection.
    pub fn overloaded(&self) {
        self.overload_rejections_total.inc();
    }

    /// Records a dropped audit event.
    pub fn audit_dropped(&self) {
        self.audit_drops_total.inc();
    }

    /// Records end-to-end latency for a mode.
    pub fn observe_duration(&self, mode: &str, seconds: f64) {
        self.execution_duration_seconds
            .with_label_values(&[truncate(mode)])
            .observe(seconds);
    }

    /// Records the estimated token cost of a request.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_tokens(&self, tokens: u64) {
        self.tokens_used.observe(tokens as f64);
    }

    /// Records captured output size for one stream.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_output(&self, stream: &str, bytes: usize) {
        self.output_bytes
            .with_label_values(&[truncate(stream)])
            .observe(bytes as f64);
    }

    /// Adjusts the active-session gauge.
    pub fn sessions_delta(&self, delta: i64) {
        self.active_sessions.add(delta);
    }

    /// Adjusts the active-container gauge.
    pub fn containers_delta(&self, delta: i64) {
        self.active_containers.add(delta);
    }

    /// Sets the idle-pool gauge.
    #[allow(clippy::cast_possible_wrap)]
    pub fn pool_idle_set(&self, idle: usize) {
        self.pool_idle.set(idle as i64);
    }

    /// Mirrors one session's entry count and summed bytes.
    #[allow(clippy::cast_possible_wrap)]
    pub fn session_usage_set(&self, session_id: &str, entries: usize, bytes: u64) {
        let label = truncate(session_id);
        self.session_entries
            .with_label_values(&[label])
            .set(entries as i64);
        self.session_bytes
            .with_label_values(&[label])
            .set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }

    /// Drops a closed or expired session's per-session gauges.
    pub fn session_usage_remove(&self, session_id: &str) {
        let label = truncate(session_id);
        let _ = self.session_entries.remove_label_values(&[label]);
        let _ = self.session_bytes.remove_label_values(&[label]);
    }

    /// Current value of the active-session gauge.
    #[must_use]
    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    /// Encodes every registered family in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] if the encoder rejects the
    /// gathered families.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Truncates a label value to [`MAX_LABEL_VALUE_LEN`] bytes on a char
/// boundary.
fn truncate(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registers_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.intent_finished("hybrid", "completed");
        metrics.cache_lookup(true);
        metrics.cache_lookup(false);
        metrics.timed_out();
        metrics.resource_exceeded("memory");
        metrics.sandbox_rejected("policy");
        metrics.token_limit_exceeded();
        metrics.fallback();
        metrics.overloaded();
        metrics.observe_duration("hybrid", 0.05);
        metrics.observe_tokens(120);
        metrics.observe_output("stdout", 4096);
        metrics.sessions_delta(1);
        metrics.containers_delta(1);
        metrics.pool_idle_set(3);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("ixo_intents_total"));
        assert!(text.contains("ixo_timed_out_total 1"));
        assert!(text.contains("ixo_cache_hits_total 1"));
        assert!(text.contains("ixo_resource_exceeded_total"));
        assert!(text.contains("ixo_active_sessions 1"));
    }

    #[test]
    fn test_label_truncation() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long).len(), MAX_LABEL_VALUE_LEN);
        assert_eq!(truncate("short"), "short");

        // Must not split a multi-byte char.
        let multi = "é".repeat(200);
        let t = truncate(&multi);
        assert!(t.len() <= MAX_LABEL_VALUE_LEN);
        assert!(multi.starts_with(t));
    }

    #[test]
    fn test_session_usage_gauges_set_and_remove() {
        let metrics = Metrics::new().unwrap();
        metrics.session_usage_set("s-1", 3, 4096);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("ixo_session_entries{session_id=\"s-1\"} 3"));
        assert!(text.contains("ixo_session_bytes{session_id=\"s-1\"} 4096"));

        metrics.session_usage_remove("s-1");
        let text = metrics.encode_text().unwrap();
        assert!(!text.contains("session_id=\"s-1\""));
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new().unwrap();
        metrics.timed_out();
        metrics.timed_out();
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("ixo_timed_out_total 2"));
    }
}
