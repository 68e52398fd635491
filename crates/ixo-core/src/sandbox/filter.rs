//! Syscall-filter sandbox tier.
//!
//! The portable fallback when no container runtime is present: a forked
//! child with a new process group, hard rlimits, the shared seccomp
//! allow-list applied pre-exec, a scratch-directory working root, and an
//! opportunistic cgroup scope for hard memory/PIDs ceilings and usage
//! accounting. Weaker than the container tier - no mount or network
//! namespace - and documented as such.
//!
//! Linux-only. On other platforms construction fails and the embedder is
//! expected to fall back to a different tier explicitly; there is no
//! silent downgrade.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::container::stage_code;
use super::output::drain_opt;
use super::{
    cgroup, classify_exit, stderr_indicates_pids_exhaustion, CodePolicy, ExecutionRequest,
    ExecutionResult, ExecutionStatus, Lifecycle, SandboxBuildError, GRACE,
};
use crate::config::Flags;
use crate::telemetry::{AuditEvent, AuditSink, Metrics};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
use super::seccomp;

/// Compiled allow-list carried by the tier. Absent on architectures
/// without a syscall-number table; rlimits and the cgroup scope still
/// apply there.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
type FilterProgram = Option<seccomp::CompiledFilter>;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
type FilterProgram = ();

/// Forked-process sandbox.
pub struct FilterSandbox {
    interpreter: Vec<String>,
    policy: CodePolicy,
    metrics: Arc<Metrics>,
    audit: AuditSink,
    filter: FilterProgram,
}

impl std::fmt::Debug for FilterSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSandbox")
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

impl FilterSandbox {
    /// Builds the tier, compiling the seccomp allow-list once.
    ///
    /// # Errors
    ///
    /// Fails off Linux, and on Linux when the allow-list does not
    /// compile.
    #[cfg(target_os = "linux")]
    pub fn new(
        flags: &Flags,
        metrics: Arc<Metrics>,
        audit: AuditSink,
    ) -> Result<Self, SandboxBuildError> {
        #[cfg(target_arch = "x86_64")]
        let filter = Some(seccomp::compile_allowlist().map_err(|e| {
            SandboxBuildError::SetupFailed {
                reason: e.to_string(),
            }
        })?);
        #[cfg(not(target_arch = "x86_64"))]
        let filter = {
            debug!("no seccomp table for this architecture, filter tier runs with rlimits only");
        };
        Ok(Self {
            interpreter: flags.interpreter.clone(),
            policy: CodePolicy::default(),
            metrics,
            audit,
            filter,
        })
    }

    /// The filter tier needs Linux.
    ///
    /// # Errors
    ///
    /// Always fails on this platform.
    #[cfg(not(target_os = "linux"))]
    pub fn new(
        _flags: &Flags,
        _metrics: Arc<Metrics>,
        _audit: AuditSink,
    ) -> Result<Self, SandboxBuildError> {
        Err(SandboxBuildError::SetupFailed {
            reason: "syscall-filter tier requires Linux".to_string(),
        })
    }

    /// Replaces the pre-launch code policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CodePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn emit(&self, event: AuditEvent) {
        if !self.audit.emit(event) {
            self.metrics.audit_dropped();
        }
    }

    fn lifecycle(&self, state: Lifecycle, request: &ExecutionRequest, outcome: &str) {
        self.emit(AuditEvent::new(state.event(), request.trace_id.clone(), outcome));
    }

    /// Runs one request to a reaped state.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        if let Some(blocked) = self.policy.screen(&request.code) {
            self.lifecycle(Lifecycle::Created, request, "rejected");
            return ExecutionResult::unlaunched(ExecutionStatus::Rejected {
                reason: format!("blocked construct: {blocked}"),
            });
        }
        self.lifecycle(Lifecycle::Created, request, "accepted");
        self.execute_inner(request).await
    }

    #[cfg(target_os = "linux")]
    #[allow(clippy::too_many_lines)]
    async fn execute_inner(&self, request: &ExecutionRequest) -> ExecutionResult {
        let staged = match stage_code(request) {
            Ok(staged) => staged,
            Err(reason) => return ExecutionResult::internal(reason),
        };
        let scratch = staged
            .code_path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);

        // Hard ceilings via an owned cgroup scope when the hierarchy is
        // delegated; rlimits below remain as the floor either way.
        let scope = cgroup::CgroupScope::create(
            &format!("ixo-{}", request.trace_id),
            request.memory_bytes,
            request.process_limit,
        );
        if scope.is_none() {
            debug!("cgroup scope unavailable, filter tier falls back to rlimits");
        }

        let mut cmd = Command::new(&self.interpreter[0]);
        cmd.args(&self.interpreter[1..])
            .arg(&staged.code_path)
            .current_dir(&scratch)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("LANG", "C.UTF-8")
            .env("HOME", &scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let memory_bytes = request.memory_bytes;
        let process_limit = u64::from(request.process_limit);
        let file_handles = u64::from(request.file_handle_limit);
        #[cfg(target_arch = "x86_64")]
        let filter = self.filter.clone();
        unsafe {
            cmd.pre_exec(move || {
                use nix::sys::resource::{setrlimit, Resource};

                let errno =
                    |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);

                // Own process group so the kill path reaps descendants.
                nix::unistd::setsid().map_err(errno)?;
                setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes).map_err(errno)?;
                setrlimit(Resource::RLIMIT_NPROC, process_limit, process_limit)
                    .map_err(errno)?;
                setrlimit(Resource::RLIMIT_NOFILE, file_handles, file_handles)
                    .map_err(errno)?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(errno)?;
                #[cfg(target_arch = "x86_64")]
                if let Some(program) = &filter {
                    seccomp::apply_filter(program)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle(Lifecycle::Reaped, request, "internal_error");
                if let Some(scope) = scope {
                    let _ = scope.finish();
                }
                return ExecutionResult::internal(format!("interpreter spawn failed: {e}"));
            }
        };
        let pid = child.id();
        if let (Some(scope), Some(pid)) = (scope.as_ref(), pid) {
            if !scope.attach(pid) {
                debug!(pid, "cgroup attach failed, limits fall back to rlimits");
            }
        }
        self.lifecycle(Lifecycle::Running, request, "launched");

        let cap = request.output_cap;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(drain_opt(stdout, cap));
        let stderr_task = tokio::spawn(drain_opt(stderr, cap));

        let (deadline_hit, wait_status) = match timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => (false, Some(status)),
            Ok(Err(e)) => {
                warn!(error = %e, "child wait failed");
                (false, None)
            }
            Err(_) => {
                self.lifecycle(Lifecycle::Killed, request, "timed_out");
                kill_process_group(pid);
                let status = match timeout(GRACE, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        let _ = child.start_kill();
                        timeout(GRACE, child.wait()).await.ok().and_then(Result::ok)
                    }
                };
                (true, status)
            }
        };

        let stdout_stream = stdout_task
            .await
            .ok()
            .map(super::output::RawCapture::into_stream)
            .unwrap_or_default();
        let stderr_stream = stderr_task
            .await
            .ok()
            .map(super::output::RawCapture::into_stream)
            .unwrap_or_default();
        let wall_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Reap any process-group stragglers before reading final usage.
        if deadline_hit {
            kill_process_group(pid);
        }
        let usage = scope.map(cgroup::CgroupScope::finish).unwrap_or_default();

        let exit_code = wait_status.as_ref().and_then(std::process::ExitStatus::code);
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            wait_status.as_ref().and_then(ExitStatusExt::signal)
        };

        // The AS rlimit surfaces as an allocator failure inside the
        // interpreter rather than a kill; fold that into the memory kind.
        let oom_killed = usage.oom_killed()
            || (exit_code.is_some_and(|c| c != 0) && stderr_stream.text.contains("MemoryError"));
        let pids_exhausted = usage.pids_exhausted()
            || (exit_code.is_some_and(|c| c != 0)
                && stderr_indicates_pids_exhaustion(&stderr_stream.text));

        let (status, exit_code) =
            classify_exit(exit_code, signal, deadline_hit, oom_killed, pids_exhausted);
        self.lifecycle(Lifecycle::Reaped, request, status.name());

        ExecutionResult {
            status,
            exit_code,
            stdout: stdout_stream,
            stderr: stderr_stream,
            wall_time_ms,
            peak_memory_bytes: usage.peak_memory_bytes,
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn execute_inner(&self, _request: &ExecutionRequest) -> ExecutionResult {
        ExecutionResult::internal("syscall-filter tier requires Linux")
    }
}

#[cfg(target_os = "linux")]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let Ok(pid) = i32::try_from(pid) else { return };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        // ESRCH means everything is already gone.
        if e != nix::errno::Errno::ESRCH {
            debug!(pid, error = %e, "process group kill failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn dev_flags() -> Flags {
        Flags {
            interpreter: vec!["sh".to_string(), "-c".to_string()],
            ..Flags::default()
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_construction_compiles_filter() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let audit = AuditSink::spawn(None);
        let sandbox = FilterSandbox::new(&dev_flags(), metrics, audit);
        assert!(sandbox.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_policy_rejection_before_launch() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let audit = AuditSink::spawn(None);
        let sandbox = FilterSandbox::new(&dev_flags(), metrics, audit).unwrap();
        let request = ExecutionRequest {
            code: "eval('1+1')".to_string(),
            timeout: Duration::from_secs(1),
            memory_bytes: 64 << 20,
            process_limit: 8,
            file_handle_limit: 32,
            output_cap: 1024,
            disk_bytes: 1 << 20,
            trace_id: "t-reject".to_string(),
        };
        let result = sandbox.execute(&request).await;
        assert!(matches!(result.status, ExecutionStatus::Rejected { .. }));
        assert_eq!(result.exit_code, None);
    }
}
