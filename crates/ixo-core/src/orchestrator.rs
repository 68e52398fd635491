//! Execution orchestrator.
//!
//! The one public operation is [`Orchestrator::execute_intent`]: assign a
//! trace id, enforce the token budget, consult the response cache,
//! dispatch by mode (protocol-only / code-execution / hybrid), and shape
//! the response. In hybrid mode the code path is attempted first and the
//! protocol collaborator is tried once - only for `rejected`,
//! `unknown_intent`, and `internal_error`. Sandbox verdicts like
//! `timed_out` and `resource_exceeded` are authoritative job outcomes and
//! are returned as-is.
//!
//! # Side-effect ordering
//!
//! Within one trace: execute → record outcome telemetry → write cache →
//! emit the terminal audit record → return. Across traces no ordering is
//! promised.
//!
//! # Admission
//!
//! Sandbox calls are capped by a semaphore sized from
//! `concurrency_cap`; waiters beyond the bounded queue are rejected with
//! `overloaded` before any side effect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::CapabilityIndex;
use crate::config::{ContextBackend, ExecutionMode, Flags};
use crate::context::{ContextStore, StoreLimits};
use crate::error::{ErrorCode, IxoError};
use crate::materialize;
use crate::protocol::{IntentRequest, Response, ResponseMetadata, ResultPayload};
use crate::sandbox::{ExecutionRequest, ExecutionStatus, Sandbox, SandboxBuildError};
use crate::session::SessionRegistry;
use crate::telemetry::{AuditEvent, AuditSink, Metrics, MetricsError};

/// Multiplier from the concurrency cap to the bounded admission queue.
const QUEUE_DEPTH_FACTOR: usize = 4;

/// The external protocol collaborator: whatever speaks the traditional
/// tool protocol on the slow path. Out of scope for this crate beyond
/// this seam.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Performs the intent through the protocol path.
    async fn call(
        &self,
        intent: &str,
        params: &serde_json::Map<String, Value>,
    ) -> Result<Value, IxoError>;
}

/// Default collaborator when none is configured: every call reports the
/// backend as unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProtocol;

#[async_trait]
impl ProtocolClient for UnconfiguredProtocol {
    async fn call(
        &self,
        _intent: &str,
        _params: &serde_json::Map<String, Value>,
    ) -> Result<Value, IxoError> {
        Err(IxoError::new(
            ErrorCode::BackendUnavailable,
            "no protocol collaborator configured",
        ))
    }
}

/// Orchestrator construction failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    /// Flags failed validation.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// Sandbox tier construction failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxBuildError),
    /// Metrics registration failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    /// The remote context backend could not be reached at startup.
    #[error("context backend: {0}")]
    Context(#[from] crate::context::ContextError),
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    flags: Flags,
    index: CapabilityIndex,
    metrics: Option<Arc<Metrics>>,
    audit: Option<AuditSink>,
    store: Option<Arc<ContextStore>>,
    protocol: Option<Arc<dyn ProtocolClient>>,
}

impl OrchestratorBuilder {
    /// Sets the capability index (defaults to [`CapabilityIndex::builtin`]).
    #[must_use]
    pub fn capabilities(mut self, index: CapabilityIndex) -> Self {
        self.index = index;
        self
    }

    /// Sets the metrics handle (defaults to a fresh registry).
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the audit sink (defaults to one spawned from the flags).
    #[must_use]
    pub fn audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sets the context store (defaults to the backend named in flags).
    #[must_use]
    pub fn store(mut self, store: Arc<ContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the protocol collaborator (defaults to
    /// [`UnconfiguredProtocol`]).
    #[must_use]
    pub fn protocol(mut self, protocol: Arc<dyn ProtocolClient>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Validates the flags and assembles the orchestrator.
    ///
    /// Must run inside a tokio runtime (the audit writer task spawns
    /// here).
    ///
    /// # Errors
    ///
    /// Propagates flag validation, metrics registration, sandbox
    /// construction, and remote-context connection failures.
    pub async fn build(self) -> Result<Orchestrator, BuildError> {
        self.flags.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new()?),
        };
        let audit = self
            .audit
            .unwrap_or_else(|| AuditSink::spawn(self.flags.audit_sink_path.clone()));

        let limits = StoreLimits {
            max_value_bytes: self.flags.context_size_limit_bytes,
            default_ttl: std::time::Duration::from_secs(self.flags.cache_ttl_seconds),
            ..StoreLimits::default()
        };
        let store = match self.store {
            Some(store) => store,
            None => match self.flags.context_backend {
                ContextBackend::Memory => Arc::new(ContextStore::memory(limits)),
                ContextBackend::RemoteKv => {
                    let url = self
                        .flags
                        .remote_kv_url
                        .as_deref()
                        .unwrap_or_default();
                    Arc::new(ContextStore::remote(url, limits).await?)
                }
            },
        };

        let sandbox = Sandbox::from_flags(&self.flags, Arc::clone(&metrics), audit.clone())?;
        let sessions = Arc::new(
            SessionRegistry::new(Arc::clone(&store), Arc::clone(&metrics))
                .with_budget(self.flags.per_session_budget_bytes),
        );

        Ok(Orchestrator {
            semaphore: Arc::new(Semaphore::new(self.flags.concurrency_cap)),
            queue_depth: self.flags.concurrency_cap * QUEUE_DEPTH_FACTOR,
            waiting: AtomicUsize::new(0),
            protocol: self.protocol.unwrap_or_else(|| Arc::new(UnconfiguredProtocol)),
            flags: self.flags,
            index: self.index,
            metrics,
            audit,
            store,
            sessions,
            sandbox,
        })
    }
}

/// The intent router and response shaper.
pub struct Orchestrator {
    flags: Flags,
    index: CapabilityIndex,
    metrics: Arc<Metrics>,
    audit: AuditSink,
    store: Arc<ContextStore>,
    sessions: Arc<SessionRegistry>,
    sandbox: Sandbox,
    protocol: Arc<dyn ProtocolClient>,
    semaphore: Arc<Semaphore>,
    queue_depth: usize,
    waiting: AtomicUsize,
}

/// What the response cache stores: the result payload plus the path that
/// produced it, so a hit replays the original mode in its metadata.
#[derive(serde::Serialize, serde::Deserialize)]
struct CachedEntry {
    mode: String,
    #[serde(flatten)]
    payload: ResultPayload,
}

/// How one code-path attempt ended, before fallback policy is applied.
enum CodeOutcome {
    /// An authoritative job result (any status the sandbox vouches for).
    Result(ResultPayload),
    /// An infrastructure-class failure eligible for hybrid fallback.
    FallbackEligible(IxoError),
    /// A validation failure; never falls back.
    Fail(IxoError),
}

impl Orchestrator {
    /// Starts a builder.
    #[must_use]
    pub fn builder(flags: Flags) -> OrchestratorBuilder {
        OrchestratorBuilder {
            flags,
            index: CapabilityIndex::builtin(),
            metrics: None,
            audit: None,
            store: None,
            protocol: None,
        }
    }

    /// The session registry backing `session_id` namespaces.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The context store.
    #[must_use]
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// The metrics handle.
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The capability index.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilityIndex {
        &self.index
    }

    /// Executes one wire request.
    pub async fn execute(&self, request: &IntentRequest) -> Response {
        self.execute_parts(&request.intent, &request.params, request.session_id.as_deref())
            .await
    }

    /// Executes an intent given as name + params value.
    ///
    /// `params` must be a JSON object or `null`.
    pub async fn execute_intent(
        &self,
        intent: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Response {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => {
                let trace_id = Uuid::new_v4().to_string();
                let metadata = self.meta_now(&trace_id, Instant::now(), 0, false);
                return self.fail_validation(
                    intent,
                    session_id,
                    IxoError::invalid("params must be a JSON object"),
                    metadata,
                );
            }
        };
        self.execute_parts(intent, &params, session_id).await
    }

    async fn execute_parts(
        &self,
        intent: &str,
        params: &serde_json::Map<String, Value>,
        session_id: Option<&str>,
    ) -> Response {
        let started = Instant::now();
        let trace_id = Uuid::new_v4().to_string();

        let request = IntentRequest {
            intent: intent.to_string(),
            params: params.clone(),
            session_id: session_id.map(ToString::to_string),
        };
        if let Err(e) = request.validate() {
            let metadata = self.meta_now(&trace_id, started, 0, false);
            return self.fail_validation(intent, session_id, e, metadata);
        }

        // Token budget, before any side effect.
        let tokens = estimate_tokens(intent, params);
        if tokens > self.flags.max_tokens_per_request {
            self.metrics.token_limit_exceeded();
            let metadata = self.meta_now(&trace_id, started, tokens, false);
            return self.fail_validation(
                intent,
                session_id,
                IxoError::new(
                    ErrorCode::TokenLimitExceeded,
                    format!(
                        "estimated {tokens} tokens exceeds budget of {}",
                        self.flags.max_tokens_per_request
                    ),
                ),
                metadata,
            );
        }

        if let Some(session) = session_id {
            self.sessions.ensure(session).await;
        }

        // Cache lookup on the canonicalized key. A failing backend reads
        // as a miss; the cache is an optimization, not a dependency.
        let cache_key = canonical_cache_key(intent, params);
        match self.store.get(&cache_key).await {
            Ok(Some(cached)) => {
                if let Ok(entry) = serde_json::from_value::<CachedEntry>(cached) {
                    self.metrics.cache_lookup(true);
                    let metadata = ResponseMetadata {
                        tokens_used: tokens,
                        execution_time_ms: elapsed_ms(started),
                        cache_hit: true,
                        mode: entry.mode,
                        trace_id: trace_id.clone(),
                    };
                    self.metrics
                        .intent_finished(&metadata.mode, &entry.payload.status);
                    self.terminal_audit(
                        "intent_complete",
                        &trace_id,
                        intent,
                        session_id,
                        &entry.payload.status,
                        true,
                    );
                    return Response::success(entry.payload, metadata);
                }
                debug!(key = %cache_key, "cache entry undecodable, treating as miss");
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "cache lookup failed, treating as miss"),
        }
        self.metrics.cache_lookup(false);

        match self.flags.mode {
            ExecutionMode::ProtocolOnly => {
                // Protocol-only delegates and returns; it is the one
                // dispatch arm exempt from the cache-write step.
                self.protocol_path(intent, params, session_id, &trace_id, started, tokens, None)
                    .await
            }
            ExecutionMode::CodeExecution => {
                match self.code_path(intent, params, &trace_id, started).await {
                    CodeOutcome::Result(payload) => {
                        self.finish_code_result(
                            payload, intent, session_id, &trace_id, started, tokens, &cache_key,
                        )
                        .await
                    }
                    CodeOutcome::FallbackEligible(e) | CodeOutcome::Fail(e) => {
                        self.finish_failure(intent, session_id, e, &trace_id, started, tokens)
                    }
                }
            }
            ExecutionMode::Hybrid => {
                match self.code_path(intent, params, &trace_id, started).await {
                    CodeOutcome::Result(payload) => {
                        self.finish_code_result(
                            payload, intent, session_id, &trace_id, started, tokens, &cache_key,
                        )
                        .await
                    }
                    CodeOutcome::FallbackEligible(e) => {
                        debug!(intent, error = %e, "hybrid fallback to protocol collaborator");
                        self.metrics.fallback();
                        // A successful fallback answer is still a success
                        // for this key and is cached like any other.
                        self.protocol_path(
                            intent,
                            params,
                            session_id,
                            &trace_id,
                            started,
                            tokens,
                            Some(&cache_key),
                        )
                        .await
                    }
                    CodeOutcome::Fail(e) => {
                        self.finish_failure(intent, session_id, e, &trace_id, started, tokens)
                    }
                }
            }
        }
    }

    /// The code path: index lookup, materialization, admission, sandbox.
    async fn code_path(
        &self,
        intent: &str,
        params: &serde_json::Map<String, Value>,
        trace_id: &str,
        started: Instant,
    ) -> CodeOutcome {
        let Some(entry) = self.index.lookup(intent) else {
            return CodeOutcome::FallbackEligible(IxoError::new(
                ErrorCode::UnknownIntent,
                format!("no capability entry for intent {intent:?}"),
            ));
        };
        let Some(template) = self.index.template(&entry.template_id) else {
            return CodeOutcome::FallbackEligible(IxoError::internal(format!(
                "capability {intent:?} names missing template {:?}",
                entry.template_id
            )));
        };

        let code = match materialize::render(template, params) {
            Ok(code) => code,
            // Missing or malformed placeholders are validation failures,
            // detected before any sandbox work.
            Err(e) => return CodeOutcome::Fail(IxoError::invalid(e.to_string())),
        };

        // The audit trail pins exactly which program ran for this trace.
        let record = AuditEvent::new("code_materialized", trace_id, "materialized")
            .intent(intent)
            .field("code_sha256", Value::String(sha256_hex(&code)));
        if !self.audit.emit(record) {
            self.metrics.audit_dropped();
        }

        // Admission: bounded queue over the sandbox semaphore.
        if self.semaphore.available_permits() == 0
            && self.waiting.load(Ordering::Acquire) >= self.queue_depth
        {
            self.metrics.overloaded();
            return CodeOutcome::Fail(IxoError::new(
                ErrorCode::Overloaded,
                "sandbox concurrency cap and admission queue are full",
            ));
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let permit = self.semaphore.acquire().await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        let Ok(_permit) = permit else {
            return CodeOutcome::FallbackEligible(IxoError::internal("admission semaphore closed"));
        };

        // The sandbox enforces the remaining wall-clock budget itself;
        // its kill-then-reap path is the cancellation propagation.
        let budget = self
            .flags
            .max_execution_time()
            .saturating_sub(started.elapsed());
        let mut exec_request =
            ExecutionRequest::from_flags(&self.flags, code, trace_id.to_string());
        exec_request.timeout = budget;

        let result = self.sandbox.execute(&exec_request).await;

        match result.status {
            ExecutionStatus::Rejected { ref reason } => {
                self.metrics.sandbox_rejected(reason);
                CodeOutcome::FallbackEligible(IxoError::new(
                    ErrorCode::SandboxRejection,
                    reason.clone(),
                ))
            }
            ExecutionStatus::InternalError { ref reason } => {
                CodeOutcome::FallbackEligible(IxoError::internal(reason.clone()))
            }
            ExecutionStatus::Completed => CodeOutcome::Result(result_payload(&result, None)),
            ExecutionStatus::TimedOut => {
                self.metrics.timed_out();
                CodeOutcome::Result(result_payload(&result, None))
            }
            ExecutionStatus::ResourceExceeded { kind } => {
                self.metrics.resource_exceeded(kind.name());
                CodeOutcome::Result(result_payload(&result, Some(kind.name())))
            }
        }
    }

    /// Shapes and finishes an authoritative code-path result, in the
    /// promised side-effect order.
    #[allow(clippy::too_many_arguments)]
    async fn finish_code_result(
        &self,
        payload: ResultPayload,
        intent: &str,
        session_id: Option<&str>,
        trace_id: &str,
        started: Instant,
        tokens: u64,
        cache_key: &str,
    ) -> Response {
        let mode = ExecutionMode::CodeExecution.name();

        // 1. Outcome telemetry.
        self.metrics.intent_finished(mode, &payload.status);
        self.metrics.observe_tokens(tokens);
        self.metrics
            .observe_duration(mode, started.elapsed().as_secs_f64());
        if let Some(stdout) = payload.data.get("stdout").and_then(Value::as_str) {
            self.metrics.observe_output("stdout", stdout.len());
        }
        if let Some(stderr) = payload.data.get("stderr").and_then(Value::as_str) {
            self.metrics.observe_output("stderr", stderr.len());
        }

        // 2. Cache write, successful completions only.
        let clean = payload.status == "completed"
            && payload.data.get("exit_code").and_then(Value::as_i64) == Some(0);
        if clean {
            self.cache_write(cache_key, mode, &payload).await;
        }

        // 3. Terminal audit record.
        self.terminal_audit(
            "intent_complete",
            trace_id,
            intent,
            session_id,
            &payload.status,
            false,
        );

        // 4. Response.
        let metadata = self.meta_at(trace_id, started, tokens, false, mode);
        Response::success(payload, metadata)
    }

    /// The protocol path, with the overall deadline applied to the
    /// collaborator call.
    ///
    /// `cache_key` is `Some` when the caller wants successful answers
    /// cached (the hybrid fallback); protocol-only dispatch passes
    /// `None` and returns without touching the cache. The side-effect
    /// order matches the code path: telemetry, cache write, audit,
    /// return.
    #[allow(clippy::too_many_arguments)]
    async fn protocol_path(
        &self,
        intent: &str,
        params: &serde_json::Map<String, Value>,
        session_id: Option<&str>,
        trace_id: &str,
        started: Instant,
        tokens: u64,
        cache_key: Option<&str>,
    ) -> Response {
        let mode = ExecutionMode::ProtocolOnly.name();
        let budget = self
            .flags
            .max_execution_time()
            .saturating_sub(started.elapsed());

        let outcome = match timeout(budget, self.protocol.call(intent, params)).await {
            Ok(result) => result,
            Err(_) => Err(IxoError::new(
                ErrorCode::TimedOut,
                "protocol collaborator deadline expired",
            )),
        };

        match outcome {
            Ok(data) => {
                let payload = ResultPayload {
                    status: "completed".to_string(),
                    kind: None,
                    data,
                };

                // 1. Outcome telemetry.
                self.metrics.intent_finished(mode, "completed");
                self.metrics.observe_tokens(tokens);
                self.metrics
                    .observe_duration(mode, started.elapsed().as_secs_f64());

                // 2. Cache write, successful completions only.
                if let Some(cache_key) = cache_key {
                    if payload.status == "completed" {
                        self.cache_write(cache_key, mode, &payload).await;
                    }
                }

                // 3. Terminal audit record.
                self.terminal_audit(
                    "intent_complete",
                    trace_id,
                    intent,
                    session_id,
                    "completed",
                    false,
                );

                // 4. Response.
                let metadata = self.meta_at(trace_id, started, tokens, false, mode);
                Response::success(payload, metadata)
            }
            Err(e) => {
                self.metrics.intent_finished(mode, e.code.name());
                let metadata = self.meta_at(trace_id, started, tokens, false, mode);
                self.fail_terminal(intent, session_id, e, metadata)
            }
        }
    }

    /// Stores a successful payload under the canonical key with the
    /// configured TTL. A failing cache backend is logged, not fatal.
    async fn cache_write(&self, cache_key: &str, mode: &str, payload: &ResultPayload) {
        let entry = CachedEntry {
            mode: mode.to_string(),
            payload: payload.clone(),
        };
        if let Ok(value) = serde_json::to_value(&entry) {
            let ttl = std::time::Duration::from_secs(self.flags.cache_ttl_seconds);
            if let Err(e) = self.store.set(cache_key, value, Some(ttl)).await {
                debug!(error = %e, "cache write failed");
            }
        }
    }

    /// Routes a code-path failure to the right finisher: validation
    /// failures skip outcome counters, everything else records one.
    fn finish_failure(
        &self,
        intent: &str,
        session_id: Option<&str>,
        error: IxoError,
        trace_id: &str,
        started: Instant,
        tokens: u64,
    ) -> Response {
        let metadata = self.meta_at(
            trace_id,
            started,
            tokens,
            false,
            ExecutionMode::CodeExecution.name(),
        );
        if error.code.kind() == crate::error::ErrorKind::Validation {
            self.fail_validation(intent, session_id, error, metadata)
        } else {
            self.fail_terminal(intent, session_id, error, metadata)
        }
    }

    /// Finishes a validation failure: terminal audit only - no outcome
    /// counters increment for requests rejected before any side effect.
    fn fail_validation(
        &self,
        intent: &str,
        session_id: Option<&str>,
        error: IxoError,
        metadata: ResponseMetadata,
    ) -> Response {
        self.terminal_audit(
            "intent_failed",
            &metadata.trace_id,
            intent,
            session_id,
            error.code.name(),
            false,
        );
        Response::failure(error.code, error.message, metadata)
    }

    /// Finishes a post-dispatch failure: counter, terminal audit,
    /// response.
    fn fail_terminal(
        &self,
        intent: &str,
        session_id: Option<&str>,
        error: IxoError,
        metadata: ResponseMetadata,
    ) -> Response {
        self.metrics.intent_finished(&metadata.mode, error.code.name());
        self.terminal_audit(
            "intent_failed",
            &metadata.trace_id,
            intent,
            session_id,
            error.code.name(),
            false,
        );
        Response::failure(error.code, error.message, metadata)
    }

    fn terminal_audit(
        &self,
        event: &str,
        trace_id: &str,
        intent: &str,
        session_id: Option<&str>,
        outcome: &str,
        cache_hit: bool,
    ) {
        let mut record = AuditEvent::new(event, trace_id, outcome)
            .intent(intent)
            .field("cache_hit", Value::Bool(cache_hit));
        if let Some(session) = session_id {
            record = record.session(session);
        }
        if !self.audit.emit(record) {
            self.metrics.audit_dropped();
            warn!(trace_id, "terminal audit record dropped");
        }
    }

    fn meta_now(
        &self,
        trace_id: &str,
        started: Instant,
        tokens: u64,
        cache_hit: bool,
    ) -> ResponseMetadata {
        self.meta_at(trace_id, started, tokens, cache_hit, self.flags.mode.name())
    }

    fn meta_at(
        &self,
        trace_id: &str,
        started: Instant,
        tokens: u64,
        cache_hit: bool,
        mode: &str,
    ) -> ResponseMetadata {
        ResponseMetadata {
            tokens_used: tokens,
            execution_time_ms: elapsed_ms(started),
            cache_hit,
            mode: mode.to_string(),
            trace_id: trace_id.to_string(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn sha256_hex(code: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(code.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Shapes a sandbox result into the cacheable payload.
fn result_payload(
    result: &crate::sandbox::ExecutionResult,
    kind: Option<&str>,
) -> ResultPayload {
    ResultPayload {
        status: result.status.name().to_string(),
        kind: kind.map(ToString::to_string),
        data: serde_json::json!({
            "stdout": result.stdout.text,
            "stderr": result.stderr.text,
            "exit_code": result.exit_code,
            "stdout_truncated": result.stdout.truncated,
            "stderr_truncated": result.stderr.truncated,
            "wall_time_ms": result.wall_time_ms,
            "peak_memory_bytes": result.peak_memory_bytes,
        }),
    }
}

/// Deterministic token estimate: serialized byte length scaled by the
/// 4-bytes-per-token rule, plus the intent name length. Monotonic in
/// input size and bounded above by twice the byte length.
#[must_use]
pub fn estimate_tokens(intent: &str, params: &serde_json::Map<String, Value>) -> u64 {
    let serialized = serde_json::to_vec(&serde_json::json!({
        "intent": intent,
        "params": params,
    }))
    .map_or(0, |b| b.len());
    (serialized as u64) / 4 + intent.len() as u64
}

/// Canonical cache key: intent plus the key-sorted rendering of params,
/// so semantically equal parameter bags hit the same entry regardless of
/// key order.
#[must_use]
pub fn canonical_cache_key(intent: &str, params: &serde_json::Map<String, Value>) -> String {
    let mut rendered = String::new();
    write_canonical(&Value::Object(params.clone()), &mut rendered);
    format!("cache:{intent}:{rendered}")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_estimate_tokens_monotonic() {
        let small = estimate_tokens("echo", &map(json!({"m": "a"})));
        let large = estimate_tokens("echo", &map(json!({"m": "a".repeat(400)})));
        assert!(large > small);
    }

    #[test]
    fn test_estimate_tokens_upper_bound() {
        let params = map(json!({"m": "abc", "n": 42}));
        let serialized =
            serde_json::to_vec(&json!({"intent": "echo", "params": params})).unwrap();
        let estimate = estimate_tokens("echo", &params);
        assert!(estimate <= 2 * serialized.len() as u64);
    }

    #[test]
    fn test_canonical_key_ignores_param_order() {
        let a = map(json!({"b": 2, "a": 1, "nested": {"y": 2, "x": 1}}));
        let b = map(json!({"a": 1, "nested": {"x": 1, "y": 2}, "b": 2}));
        assert_eq!(
            canonical_cache_key("intent", &a),
            canonical_cache_key("intent", &b)
        );
    }

    #[test]
    fn test_canonical_key_distinguishes_values() {
        let a = map(json!({"a": 1}));
        let b = map(json!({"a": 2}));
        assert_ne!(
            canonical_cache_key("intent", &a),
            canonical_cache_key("intent", &b)
        );
        assert_ne!(
            canonical_cache_key("x", &a),
            canonical_cache_key("y", &a)
        );
    }

    #[test]
    fn test_canonical_key_arrays_keep_order() {
        let a = map(json!({"v": [1, 2]}));
        let b = map(json!({"v": [2, 1]}));
        assert_ne!(
            canonical_cache_key("intent", &a),
            canonical_cache_key("intent", &b)
        );
    }
}
