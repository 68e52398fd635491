//! Process-wide feature flags and limits.
//!
//! A [`Flags`] record is constructed once by the embedder, validated, and
//! shared read-only across every request. Nothing in this module reads
//! config files - file loading belongs to the embedder.
//!
//! Validation is fail-closed: a production configuration that disables the
//! sandbox, routes to the in-process tier, or names any network policy
//! other than deny-all is rejected before the first request is served.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default overall execution deadline (30 s).
pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 30_000;

/// Default hard memory ceiling (512 MiB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * (1 << 20);

/// Default PIDs controller limit.
pub const DEFAULT_MAX_PROCESS_COUNT: u32 = 50;

/// Default open file-handle limit.
pub const DEFAULT_MAX_FILE_HANDLES: u32 = 100;

/// Default per-stream captured output cap (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1 << 20;

/// Default per-request token budget.
pub const DEFAULT_MAX_TOKENS_PER_REQUEST: u64 = 1000;

/// Default response-cache TTL (5 min).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Default per-value context size ceiling (100 KiB).
pub const DEFAULT_CONTEXT_SIZE_LIMIT_BYTES: usize = 100 * 1024;

/// Default budget for the summed size of one session's entries (100 KiB).
pub const DEFAULT_PER_SESSION_BUDGET_BYTES: u64 = 100 * 1024;

/// Default writable scratch size inside the sandbox (100 MiB).
pub const DEFAULT_DISK_BYTES: u64 = 100 * (1 << 20);

/// Interval between deadline expiry and forced kill-then-reap (2 s).
pub const GRACE_MS: u64 = 2_000;

/// Global routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every intent is delegated to the protocol collaborator.
    ProtocolOnly,
    /// Every known intent is materialized and executed in the sandbox.
    CodeExecution,
    /// Code path first; one fallback to the protocol collaborator on
    /// infrastructure failures.
    #[default]
    Hybrid,
}

impl ExecutionMode {
    /// Metrics/metadata label for this mode.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ProtocolOnly => "protocol",
            Self::CodeExecution => "code_execution",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Sandbox isolation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// Fresh rootless container per call. Production default.
    #[default]
    Container,
    /// Forked process with seccomp + rlimits. Portable fallback.
    SyscallFilter,
    /// Direct child process, no isolation. Development only; refused in
    /// production mode.
    InProcess,
}

impl SandboxBackend {
    /// Label for metrics and audit records.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::SyscallFilter => "syscall_filter",
            Self::InProcess => "in_process",
        }
    }
}

/// Context store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextBackend {
    /// Mutex-guarded in-process map with LRU eviction.
    #[default]
    Memory,
    /// Remote key-value server with per-key TTL.
    RemoteKv,
}

/// Network policy inside the sandbox. Deny-all is the only permitted value;
/// the variant exists so configurations are explicit rather than implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No interfaces inside the namespace.
    #[default]
    DenyAll,
}

/// Configuration errors. All are fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Production mode requires the sandbox.
    #[error("production mode requires enable_sandbox=true")]
    SandboxDisabledInProduction,

    /// The in-process tier is not permitted in production.
    #[error("sandbox_backend=in_process is not permitted in production mode")]
    InProcessInProduction,

    /// The remote KV backend needs a URL.
    #[error("context_backend=remote_kv requires remote_kv_url")]
    MissingRemoteKvUrl,

    /// A numeric limit is zero or otherwise unusable.
    #[error("invalid value for {field}: {reason}")]
    InvalidLimit {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Process-wide feature flags. Immutable after [`Flags::validate`] passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Flags {
    /// Global routing policy.
    pub mode: ExecutionMode,
    /// Whether the orchestrator is serving production traffic. Tightens
    /// validation; it does not change routing.
    pub production: bool,
    /// Master sandbox switch. Must be `true` in production.
    pub enable_sandbox: bool,
    /// Isolation tier.
    pub sandbox_backend: SandboxBackend,
    /// Overall per-call deadline in milliseconds.
    pub max_execution_time_ms: u64,
    /// Hard memory ceiling in bytes. Swap is always disabled.
    pub max_memory_bytes: u64,
    /// PIDs controller limit.
    pub max_process_count: u32,
    /// Open file-handle limit.
    pub max_file_handles: u32,
    /// Captured output cap per stream, in bytes.
    pub max_output_bytes: usize,
    /// Per-request token budget.
    pub max_tokens_per_request: u64,
    /// Response-cache TTL in seconds.
    pub cache_ttl_seconds: u64,
    /// Per-value context size ceiling in bytes.
    pub context_size_limit_bytes: usize,
    /// Ceiling on the summed size of one session's entries, in bytes.
    pub per_session_budget_bytes: u64,
    /// Context store backend.
    pub context_backend: ContextBackend,
    /// Remote KV URL; required when `context_backend` is `remote_kv`.
    pub remote_kv_url: Option<String>,
    /// Maximum concurrent sandbox calls. Defaults to `cores × 2`.
    pub concurrency_cap: usize,
    /// Pre-launched container pool size. `0` disables pooling.
    pub pool_size: usize,
    /// Sandbox network policy. Deny-all is the only value.
    pub network_policy: NetworkPolicy,
    /// Writable scratch size inside the sandbox, in bytes.
    pub disk_bytes: u64,
    /// Path of the line-delimited JSON audit sink. `None` logs to tracing
    /// only.
    pub audit_sink_path: Option<std::path::PathBuf>,
    /// Listen address for the Prometheus scrape endpoint.
    pub metrics_listen_addr: Option<String>,
    /// Container runtime binary (`docker` or `podman`).
    pub container_runtime: String,
    /// Container image for the execution interpreter.
    pub container_image: String,
    /// Interpreter argv for the non-container tiers. The materialized code
    /// file path is appended.
    pub interpreter: Vec<String>,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            production: false,
            enable_sandbox: true,
            sandbox_backend: SandboxBackend::default(),
            max_execution_time_ms: DEFAULT_MAX_EXECUTION_TIME_MS,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_process_count: DEFAULT_MAX_PROCESS_COUNT,
            max_file_handles: DEFAULT_MAX_FILE_HANDLES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_tokens_per_request: DEFAULT_MAX_TOKENS_PER_REQUEST,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            context_size_limit_bytes: DEFAULT_CONTEXT_SIZE_LIMIT_BYTES,
            per_session_budget_bytes: DEFAULT_PER_SESSION_BUDGET_BYTES,
            context_backend: ContextBackend::default(),
            remote_kv_url: None,
            concurrency_cap: default_concurrency_cap(),
            pool_size: 0,
            network_policy: NetworkPolicy::default(),
            disk_bytes: DEFAULT_DISK_BYTES,
            audit_sink_path: None,
            metrics_listen_addr: None,
            container_runtime: "docker".to_string(),
            container_image: "python:3.11-slim".to_string(),
            interpreter: vec!["python3".to_string()],
        }
    }
}

fn default_concurrency_cap() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get() * 2)
}

impl Flags {
    /// Overall per-call deadline as a [`Duration`].
    #[must_use]
    pub const fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    /// Validates the record. Must pass before the first request is served.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint. Production mode requires the
    /// sandbox enabled and a tier other than `in_process`; the remote KV
    /// backend requires a URL; every limit must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.production {
            if !self.enable_sandbox {
                return Err(ConfigError::SandboxDisabledInProduction);
            }
            if self.sandbox_backend == SandboxBackend::InProcess {
                return Err(ConfigError::InProcessInProduction);
            }
        }
        if self.context_backend == ContextBackend::RemoteKv && self.remote_kv_url.is_none() {
            return Err(ConfigError::MissingRemoteKvUrl);
        }
        for (field, value) in [
            ("max_execution_time_ms", self.max_execution_time_ms),
            ("max_memory_bytes", self.max_memory_bytes),
            ("max_tokens_per_request", self.max_tokens_per_request),
            ("cache_ttl_seconds", self.cache_ttl_seconds),
            ("disk_bytes", self.disk_bytes),
            ("per_session_budget_bytes", self.per_session_budget_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidLimit {
                    field,
                    reason: "must be non-zero".to_string(),
                });
            }
        }
        if self.max_process_count == 0 || self.max_file_handles == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "max_process_count/max_file_handles",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.max_output_bytes == 0 || self.context_size_limit_bytes == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "max_output_bytes/context_size_limit_bytes",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.concurrency_cap == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "concurrency_cap",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.interpreter.is_empty() {
            return Err(ConfigError::InvalidLimit {
                field: "interpreter",
                reason: "argv must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
