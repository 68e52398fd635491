//! Multi-tier execution sandbox.
//!
//! The sandbox is the project's trust boundary: given a fully
//! materialized program, it produces an [`ExecutionResult`] under strict
//! isolation and bounded resources, and guarantees that no child process
//! or container outlives the call by more than the grace window.
//!
//! # Tiers
//!
//! Three backends share one contract, selected at construction as a
//! closed variant type:
//!
//! - [`ContainerSandbox`]: fresh rootless container per call. Namespace
//!   isolation, cgroup limits, seccomp allow-list, MAC profile, read-only
//!   root, no network interfaces. Production default.
//! - [`FilterSandbox`]: forked process with the same seccomp allow-list
//!   plus rlimits and scratch-directory confinement. Portable fallback
//!   when no container runtime is present; weaker.
//! - [`InProcessSandbox`]: direct child process, development only.
//!   Constructing it in production mode is a hard error - the guard lives
//!   here, at construction, not in routing.
//!
//! # Lifecycle
//!
//! ```text
//!  created ──launch──▶ running ──exit──▶ reaped
//!     │                   │
//!     │                deadline / memory / pids
//!     │                   │
//!     └──reject──▶     killed ──▶ reaped
//! ```
//!
//! Every path reaches `reaped`, including errors. Transitions surface as
//! audit events. The sandbox never retries and never partial-commits.

mod cgroup;
mod container;
mod filter;
mod inproc;
pub mod mac;
mod output;
mod pool;
mod seccomp;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cgroup::{CgroupScope, CgroupUsage};
pub use container::ContainerSandbox;
pub use filter::FilterSandbox;
pub use inproc::InProcessSandbox;
pub use output::{drain_stream, CapturedStream};
pub use pool::ContainerPool;
pub use seccomp::runtime_profile_json;

use crate::config::{Flags, SandboxBackend, GRACE_MS};
use crate::telemetry::{AuditSink, Metrics};

/// Grace window between deadline expiry and completed reap.
pub const GRACE: Duration = Duration::from_millis(GRACE_MS);

/// Resource controller that terminated a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// The memory ceiling.
    Memory,
    /// The PIDs limit.
    Processes,
}

impl ResourceKind {
    /// Metrics/audit label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Processes => "processes",
        }
    }
}

/// Terminal status of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The child exited on its own.
    Completed,
    /// Killed by the wall-clock deadline.
    TimedOut,
    /// Killed by a resource controller.
    ResourceExceeded {
        /// Which controller fired.
        kind: ResourceKind,
    },
    /// The sandbox refused to run the program.
    Rejected {
        /// Why it was refused.
        reason: String,
    },
    /// Launch or infrastructure failure; the run is not authoritative.
    InternalError {
        /// What failed.
        reason: String,
    },
}

impl ExecutionStatus {
    /// Wire/status label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::Rejected { .. } => "rejected",
            Self::InternalError { .. } => "internal_error",
        }
    }
}

/// Lifecycle states, surfaced through audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepted, not yet launched.
    Created,
    /// Child running.
    Running,
    /// Kill signal delivered.
    Killed,
    /// Exit status collected; terminal.
    Reaped,
}

impl Lifecycle {
    /// Audit event name for a transition into this state.
    #[must_use]
    pub const fn event(self) -> &'static str {
        match self {
            Self::Created => "sandbox_created",
            Self::Running => "sandbox_launch",
            Self::Killed => "sandbox_kill",
            Self::Reaped => "sandbox_reap",
        }
    }
}

/// A fully materialized program plus its budgets, ready for launch.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Materialized program text.
    pub code: String,
    /// Wall-clock deadline.
    pub timeout: Duration,
    /// Hard memory ceiling in bytes; swap disabled.
    pub memory_bytes: u64,
    /// PIDs controller limit.
    pub process_limit: u32,
    /// Open file-handle limit.
    pub file_handle_limit: u32,
    /// Captured output cap per stream.
    pub output_cap: usize,
    /// Writable scratch size in bytes.
    pub disk_bytes: u64,
    /// Per-call identifier; container names and scratch paths derive from
    /// it so a leaked resource is attributable.
    pub trace_id: String,
}

impl ExecutionRequest {
    /// Builds a request from the process flags.
    #[must_use]
    pub fn from_flags(flags: &Flags, code: String, trace_id: String) -> Self {
        Self {
            code,
            timeout: flags.max_execution_time(),
            memory_bytes: flags.max_memory_bytes,
            process_limit: flags.max_process_count,
            file_handle_limit: flags.max_file_handles,
            output_cap: flags.max_output_bytes,
            disk_bytes: flags.disk_bytes,
            trace_id,
        }
    }
}

/// The outcome of one sandbox call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Child exit code. Present iff the status is `completed` or
    /// `resource_exceeded`.
    pub exit_code: Option<i32>,
    /// Captured, redacted stdout.
    pub stdout: CapturedStream,
    /// Captured, redacted stderr.
    pub stderr: CapturedStream,
    /// Observed wall time in milliseconds.
    pub wall_time_ms: u64,
    /// Peak memory from the cgroup counter, best-effort.
    pub peak_memory_bytes: Option<u64>,
}

impl ExecutionResult {
    /// A result for a run that never launched.
    #[must_use]
    pub fn unlaunched(status: ExecutionStatus) -> Self {
        Self {
            status,
            exit_code: None,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            wall_time_ms: 0,
            peak_memory_bytes: None,
        }
    }

    /// Shorthand for an internal error result.
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::unlaunched(ExecutionStatus::InternalError {
            reason: reason.into(),
        })
    }
}

/// Construction-time sandbox failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxBuildError {
    /// The in-process tier was requested in production mode.
    #[error("in-process sandbox tier is not permitted in production mode")]
    InProcessInProduction,

    /// The sandbox is disabled but production mode requires it.
    #[error("production mode requires the sandbox to be enabled")]
    SandboxDisabled,

    /// Backend-specific setup failed.
    #[error("sandbox backend setup failed: {reason}")]
    SetupFailed {
        /// What failed.
        reason: String,
    },
}

/// Pre-launch screen applied to materialized programs.
///
/// A blocked construct is an authoritative `rejected` outcome, not an
/// infrastructure failure. The default list targets dynamic evaluation
/// and process escape helpers that no template legitimately needs.
#[derive(Debug, Clone)]
pub struct CodePolicy {
    blocked: Vec<String>,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            blocked: [
                "__import__",
                "eval(",
                "exec(",
                "compile(",
                "ctypes",
                "subprocess",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl CodePolicy {
    /// A policy with no blocked constructs.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            blocked: Vec::new(),
        }
    }

    /// Adds a blocked substring.
    #[must_use]
    pub fn block(mut self, construct: impl Into<String>) -> Self {
        self.blocked.push(construct.into());
        self
    }

    /// Screens a program. Returns the first blocked construct found.
    #[must_use]
    pub fn screen(&self, code: &str) -> Option<&str> {
        self.blocked
            .iter()
            .find(|b| code.contains(b.as_str()))
            .map(String::as_str)
    }
}

/// The sandbox, as a closed variant over the three tiers.
#[derive(Debug)]
pub enum Sandbox {
    /// Container tier.
    Container(ContainerSandbox),
    /// Syscall-filter tier.
    SyscallFilter(FilterSandbox),
    /// Development-only tier.
    InProcess(InProcessSandbox),
}

impl Sandbox {
    /// Constructs the tier selected by the flags.
    ///
    /// # Errors
    ///
    /// [`SandboxBuildError::InProcessInProduction`] when production mode
    /// asks for the development tier, [`SandboxBuildError::SandboxDisabled`]
    /// when production mode disables the sandbox, and
    /// [`SandboxBuildError::SetupFailed`] for backend setup problems.
    pub fn from_flags(
        flags: &Flags,
        metrics: Arc<Metrics>,
        audit: AuditSink,
    ) -> Result<Self, SandboxBuildError> {
        if flags.production && !flags.enable_sandbox {
            return Err(SandboxBuildError::SandboxDisabled);
        }
        match flags.sandbox_backend {
            SandboxBackend::Container => Ok(Self::Container(ContainerSandbox::new(
                flags, metrics, audit,
            )?)),
            SandboxBackend::SyscallFilter => {
                Ok(Self::SyscallFilter(FilterSandbox::new(flags, metrics, audit)?))
            }
            SandboxBackend::InProcess => {
                if flags.production {
                    return Err(SandboxBuildError::InProcessInProduction);
                }
                Ok(Self::InProcess(InProcessSandbox::new(flags, metrics, audit)))
            }
        }
    }

    /// Runs one request to a terminal, reaped state.
    ///
    /// Infallible by design: launch and infrastructure failures fold into
    /// an `internal_error` status so a full result is always produced.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        match self {
            Self::Container(s) => s.execute(request).await,
            Self::SyscallFilter(s) => s.execute(request).await,
            Self::InProcess(s) => s.execute(request).await,
        }
    }

    /// Tier label for metrics and audit.
    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Container(_) => "container",
            Self::SyscallFilter(_) => "syscall_filter",
            Self::InProcess(_) => "in_process",
        }
    }
}

/// Shared exit classification for the container and pooled paths.
///
/// Priority: memory kill, then PIDs exhaustion, then the wall clock, then
/// the child's own exit. A signal death with no better explanation maps
/// to the conventional `128 + signo` exit code.
#[allow(clippy::fn_params_excessive_bools)]
fn classify_exit(
    exit_code: Option<i32>,
    signal: Option<i32>,
    deadline_hit: bool,
    oom_killed: bool,
    pids_exhausted: bool,
) -> (ExecutionStatus, Option<i32>) {
    if oom_killed {
        return (
            ExecutionStatus::ResourceExceeded {
                kind: ResourceKind::Memory,
            },
            exit_code.or(signal.map(|s| 128 + s)),
        );
    }
    if pids_exhausted {
        return (
            ExecutionStatus::ResourceExceeded {
                kind: ResourceKind::Processes,
            },
            exit_code.or(signal.map(|s| 128 + s)),
        );
    }
    if deadline_hit {
        return (ExecutionStatus::TimedOut, None);
    }
    match (exit_code, signal) {
        (Some(code), _) => (ExecutionStatus::Completed, Some(code)),
        (None, Some(signo)) => (ExecutionStatus::Completed, Some(128 + signo)),
        (None, None) => (
            ExecutionStatus::InternalError {
                reason: "child exit status unavailable".to_string(),
            },
            None,
        ),
    }
}

/// Markers a fork-starved interpreter leaves on stderr. Used by the
/// container tier, where the per-call cgroup is gone by classification
/// time; the filter tier reads `pids.events` directly.
const PIDS_EXHAUSTION_MARKERS: &[&str] = &[
    "Resource temporarily unavailable",
    "can't start new thread",
    "Cannot fork",
    "fork failed",
];

fn stderr_indicates_pids_exhaustion(stderr: &str) -> bool {
    PIDS_EXHAUSTION_MARKERS.iter().any(|m| stderr.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(ExecutionStatus::Completed.name(), "completed");
        assert_eq!(ExecutionStatus::TimedOut.name(), "timed_out");
        assert_eq!(
            ExecutionStatus::ResourceExceeded {
                kind: ResourceKind::Memory
            }
            .name(),
            "resource_exceeded"
        );
    }

    #[test]
    fn test_classify_priority_memory_over_deadline() {
        let (status, _) = classify_exit(None, Some(9), true, true, false);
        assert_eq!(
            status,
            ExecutionStatus::ResourceExceeded {
                kind: ResourceKind::Memory
            }
        );
    }

    #[test]
    fn test_classify_pids_keeps_exit_code() {
        let (status, code) = classify_exit(Some(1), None, false, false, true);
        assert_eq!(
            status,
            ExecutionStatus::ResourceExceeded {
                kind: ResourceKind::Processes
            }
        );
        assert_eq!(code, Some(1));
    }

    #[test]
    fn test_classify_deadline_has_no_exit_code() {
        let (status, code) = classify_exit(None, Some(9), true, false, false);
        assert_eq!(status, ExecutionStatus::TimedOut);
        assert_eq!(code, None);
    }

    #[test]
    fn test_classify_normal_exit() {
        let (status, code) = classify_exit(Some(0), None, false, false, false);
        assert_eq!(status, ExecutionStatus::Completed);
        assert_eq!(code, Some(0));

        let (status, code) = classify_exit(None, Some(15), false, false, false);
        assert_eq!(status, ExecutionStatus::Completed);
        assert_eq!(code, Some(143));
    }

    #[test]
    fn test_classify_missing_status_is_internal() {
        let (status, code) = classify_exit(None, None, false, false, false);
        assert!(matches!(status, ExecutionStatus::InternalError { .. }));
        assert_eq!(code, None);
    }

    #[test]
    fn test_code_policy_screen() {
        let policy = CodePolicy::default();
        assert!(policy.screen("print('hi')").is_none());
        assert_eq!(policy.screen("eval('1+1')"), Some("eval("));
        assert_eq!(
            policy.screen("import subprocess; subprocess.run(['ls'])"),
            Some("subprocess")
        );

        let permissive = CodePolicy::permissive();
        assert!(permissive.screen("eval('1+1')").is_none());
    }

    #[test]
    fn test_pids_markers() {
        assert!(stderr_indicates_pids_exhaustion(
            "BlockingIOError: [Errno 11] Resource temporarily unavailable"
        ));
        assert!(!stderr_indicates_pids_exhaustion("NameError: x"));
    }

    #[test]
    fn test_production_guard_at_construction() {
        let flags = Flags {
            production: true,
            sandbox_backend: SandboxBackend::InProcess,
            ..Flags::default()
        };
        let metrics = Arc::new(Metrics::new().unwrap());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let audit = AuditSink::spawn(None);
        let err = Sandbox::from_flags(&flags, metrics, audit).unwrap_err();
        assert!(matches!(err, SandboxBuildError::InProcessInProduction));
    }

    #[test]
    fn test_request_from_flags() {
        let flags = Flags::default();
        let req = ExecutionRequest::from_flags(&flags, "print(1)".to_string(), "t".to_string());
        assert_eq!(req.timeout, Duration::from_millis(30_000));
        assert_eq!(req.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(req.process_limit, 50);
        assert_eq!(req.output_cap, 1 << 20);
    }
}
