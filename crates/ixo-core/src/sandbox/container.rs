//! Container sandbox tier.
//!
//! One fresh container per call, torn down before the result is
//! returned. Isolation comes from the runtime: separate PID/network/
//! mount/IPC/UTS namespaces, cgroup v2 ceilings with swap pinned to the
//! memory limit, a default-deny seccomp profile, an optional AppArmor
//! profile, a read-only root with one bounded tmpfs scratch mount, all
//! capabilities dropped, `no-new-privileges`, and no interfaces inside
//! the network namespace.
//!
//! The runtime client (`docker run` / `podman run`) is the child we hold;
//! its exit code mirrors the container's. Classification prefers cgroup
//! evidence sampled while the container runs, falling back to `inspect`
//! and stderr markers once the per-call cgroup is gone.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{NamedTempFile, TempDir};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::output::drain_opt;
use super::{
    cgroup, classify_exit, mac, seccomp, stderr_indicates_pids_exhaustion, CodePolicy,
    ContainerPool, ExecutionRequest, ExecutionResult, ExecutionStatus, Lifecycle,
    SandboxBuildError, GRACE,
};
use crate::config::Flags;
use crate::telemetry::{AuditEvent, AuditSink, Metrics};

/// Timeout for auxiliary runtime commands (`kill`, `rm`, `inspect`).
const RUNTIME_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Sampling interval for the per-call cgroup while the container runs.
const CGROUP_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// `docker run` exit codes that signal a client/daemon failure rather
/// than a child exit: 125 (daemon error), 126 (not executable),
/// 127 (command not found).
const RUNTIME_FAILURE_EXIT_CODES: &[i32] = &[125, 126, 127];

/// Container name for a trace.
fn container_name(trace_id: &str) -> String {
    format!("ixo-{trace_id}")
}

/// The per-call limits rendered into runtime flags.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IsolationLimits {
    pub memory_bytes: u64,
    pub process_limit: u32,
    pub file_handle_limit: u32,
    pub disk_bytes: u64,
}

impl IsolationLimits {
    pub(crate) fn from_request(request: &ExecutionRequest) -> Self {
        Self {
            memory_bytes: request.memory_bytes,
            process_limit: request.process_limit,
            file_handle_limit: request.file_handle_limit,
            disk_bytes: request.disk_bytes,
        }
    }
}

/// Shared isolation flags for cold and pooled launches.
///
/// Deterministic for the same inputs; order is fixed so tests can assert
/// the full command line.
pub(crate) fn isolation_args(
    limits: IsolationLimits,
    seccomp_profile: &Path,
    apparmor_profile: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "--network".to_string(),
        "none".to_string(),
        "--memory".to_string(),
        limits.memory_bytes.to_string(),
        // Swap pinned to the memory limit: no swap headroom.
        "--memory-swap".to_string(),
        limits.memory_bytes.to_string(),
        "--cpus".to_string(),
        "1".to_string(),
        "--pids-limit".to_string(),
        limits.process_limit.to_string(),
        "--ulimit".to_string(),
        format!(
            "nofile={}:{}",
            limits.file_handle_limit, limits.file_handle_limit
        ),
        "--read-only".to_string(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--security-opt".to_string(),
        format!("seccomp={}", seccomp_profile.display()),
        "--ipc".to_string(),
        "private".to_string(),
        "--tmpfs".to_string(),
        format!(
            "/scratch:rw,noexec,nosuid,size={},mode=0700",
            limits.disk_bytes
        ),
    ];
    if let Some(profile) = apparmor_profile {
        args.push("--security-opt".to_string());
        args.push(format!("apparmor={profile}"));
    }
    args
}

/// Container-tier sandbox.
#[derive(Debug)]
pub struct ContainerSandbox {
    runtime: String,
    image: String,
    interpreter: Vec<String>,
    policy: CodePolicy,
    metrics: Arc<Metrics>,
    audit: AuditSink,
    /// Seccomp profile JSON, kept alive for the sandbox's lifetime.
    seccomp_profile: NamedTempFile,
    apparmor_profile: Option<&'static str>,
    pool: Option<ContainerPool>,
}

impl ContainerSandbox {
    /// Builds the tier, writing the seccomp profile to disk and starting
    /// the pool when configured.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxBuildError::SetupFailed`] when the profile cannot
    /// be written.
    pub fn new(
        flags: &Flags,
        metrics: Arc<Metrics>,
        audit: AuditSink,
    ) -> Result<Self, SandboxBuildError> {
        let seccomp_profile = write_seccomp_profile()?;
        let apparmor_profile = if mac::profile_loaded() {
            Some(mac::PROFILE_NAME)
        } else {
            debug!(profile = mac::PROFILE_NAME, "apparmor profile not loaded, omitting runtime flag");
            None
        };
        let pool = if flags.pool_size > 0 {
            Some(ContainerPool::new(
                flags.container_runtime.clone(),
                flags.container_image.clone(),
                flags.pool_size,
                seccomp_profile.path().to_path_buf(),
                apparmor_profile,
                Arc::clone(&metrics),
            ))
        } else {
            None
        };
        Ok(Self {
            runtime: flags.container_runtime.clone(),
            image: flags.container_image.clone(),
            interpreter: flags.interpreter.clone(),
            policy: CodePolicy::default(),
            metrics,
            audit,
            seccomp_profile,
            apparmor_profile,
            pool,
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

        if let Some(pool) = &self.pool {
            return pool
                .execute(request, &self.interpreter, &self.audit)
                .await;
        }
        self.execute_cold(request).await
    }

    async fn execute_cold(&self, request: &ExecutionRequest) -> ExecutionResult {
        let staged = match stage_code(request) {
            Ok(staged) => staged,
            Err(reason) => return ExecutionResult::internal(reason),
        };
        let name = container_name(&request.trace_id);

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "--name".to_string(),
            name.clone(),
            "--workdir".to_string(),
            "/scratch".to_string(),
        ];
        args.extend(isolation_args(
            IsolationLimits::from_request(request),
            self.seccomp_profile.path(),
            self.apparmor_profile,
        ));
        args.push("-v".to_string());
        args.push(format!("{}:/code/main.py:ro", staged.code_path.display()));
        args.push(self.image.clone());
        args.extend(self.interpreter.iter().cloned());
        args.push("/code/main.py".to_string());

        let started = Instant::now();
        let mut child = match Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Last-resort cleanup if this future is ever dropped mid-call.
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle(Lifecycle::Reaped, request, "internal_error");
                return ExecutionResult::internal(format!("container runtime spawn failed: {e}"));
            }
        };

        self.metrics.containers_delta(1);
        self.lifecycle(Lifecycle::Running, request, "launched");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = request.output_cap;
        let stdout_task = tokio::spawn(drain_opt(stdout, cap));
        let stderr_task = tokio::spawn(drain_opt(stderr, cap));

        // Sample the container's cgroup while it runs; the scope is gone
        // by the time we classify.
        let peak = Arc::new(AtomicU64::new(0));
        let pids_hits = Arc::new(AtomicU64::new(0));
        let oom_kills = Arc::new(AtomicU64::new(0));
        let sampler = tokio::spawn(sample_cgroup(
            self.runtime.clone(),
            name.clone(),
            Arc::clone(&peak),
            Arc::clone(&pids_hits),
            Arc::clone(&oom_kills),
        ));

        let (deadline_hit, wait_status) = match timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => (false, Some(status)),
            Ok(Err(e)) => {
                warn!(error = %e, "container wait failed");
                (false, None)
            }
            Err(_) => {
                self.lifecycle(Lifecycle::Killed, request, "timed_out");
                let killed = self.kill_and_reap(&name, &mut child).await;
                (true, killed)
            }
        };
        sampler.abort();

        let stdout_raw = stdout_task.await.ok();
        let stderr_raw = stderr_task.await.ok();
        let wall_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Post-exit evidence: inspect still sees the stopped container
        // because we reap with an explicit rm below.
        let inspected_oom = self.inspect_oom(&name).await;
        let _ = self
            .runtime_cmd(&["rm", "-f", &name], RUNTIME_CMD_TIMEOUT)
            .await;
        self.metrics.containers_delta(-1);

        let stderr_stream = stderr_raw
            .map(super::output::RawCapture::into_stream)
            .unwrap_or_default();
        let stdout_stream = stdout_raw
            .map(super::output::RawCapture::into_stream)
            .unwrap_or_default();

        let exit_code = wait_status.as_ref().and_then(std::process::ExitStatus::code);
        let signal = wait_signal(wait_status.as_ref());
        if let Some(code) = exit_code {
            if RUNTIME_FAILURE_EXIT_CODES.contains(&code) && !deadline_hit {
                self.lifecycle(Lifecycle::Reaped, request, "internal_error");
                return ExecutionResult {
                    status: ExecutionStatus::InternalError {
                        reason: format!(
                            "container runtime failure (exit {code}): {}",
                            stderr_stream.text.lines().next().unwrap_or("")
                        ),
                    },
                    exit_code: None,
                    stdout: stdout_stream,
                    stderr: stderr_stream,
                    wall_time_ms,
                    peak_memory_bytes: None,
                };
            }
        }

        let oom_killed = oom_kills.load(Ordering::Relaxed) > 0 || inspected_oom;
        let pids_exhausted = pids_hits.load(Ordering::Relaxed) > 0
            || (exit_code.is_some_and(|c| c != 0)
                && stderr_indicates_pids_exhaustion(&stderr_stream.text));

        let (status, exit_code) =
            classify_exit(exit_code, signal, deadline_hit, oom_killed, pids_exhausted);
        self.lifecycle(Lifecycle::Reaped, request, status.name());

        let sampled_peak = peak.load(Ordering::Relaxed);
        ExecutionResult {
            status,
            exit_code,
            stdout: stdout_stream,
            stderr: stderr_stream,
            wall_time_ms,
            peak_memory_bytes: (sampled_peak > 0).then_some(sampled_peak),
        }
    }

    /// Delivers SIGKILL via the runtime and collects the client's exit
    /// within the grace window.
    async fn kill_and_reap(
        &self,
        name: &str,
        child: &mut tokio::process::Child,
    ) -> Option<std::process::ExitStatus> {
        let _ = self
            .runtime_cmd(&["kill", "--signal", "KILL", name], RUNTIME_CMD_TIMEOUT)
            .await;
        match timeout(GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                // The client itself is stuck; kill it directly.
                let _ = child.start_kill();
                timeout(GRACE, child.wait()).await.ok().and_then(Result::ok)
            }
        }
    }

    async fn inspect_oom(&self, name: &str) -> bool {
        let output = self
            .runtime_cmd(
                &["inspect", "-f", "{{.State.OOMKilled}}", name],
                RUNTIME_CMD_TIMEOUT,
            )
            .await;
        output.is_some_and(|out| out.trim() == "true")
    }

    async fn runtime_cmd(&self, args: &[&str], limit: Duration) -> Option<String> {
        run_runtime_cmd(&self.runtime, args, limit).await
    }
}

/// Runs an auxiliary runtime command, returning stdout on success.
pub(crate) async fn run_runtime_cmd(
    runtime: &str,
    args: &[&str],
    limit: Duration,
) -> Option<String> {
    let result = timeout(
        limit,
        Command::new(runtime)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            debug!(
                args = ?args,
                code = ?output.status.code(),
                "runtime command failed"
            );
            None
        }
        Ok(Err(e)) => {
            debug!(args = ?args, error = %e, "runtime command spawn failed");
            None
        }
        Err(_) => {
            warn!(args = ?args, "runtime command timed out");
            None
        }
    }
}

/// Staged per-call code file. The directory is removed on drop.
pub(crate) struct StagedCode {
    _dir: TempDir,
    pub code_path: PathBuf,
}

/// Writes the materialized program into an ephemeral directory.
pub(crate) fn stage_code(request: &ExecutionRequest) -> Result<StagedCode, String> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("ixo-{}-", request.trace_id))
        .tempdir()
        .map_err(|e| format!("scratch dir creation failed: {e}"))?;
    let code_path = dir.path().join("main.py");
    std::fs::write(&code_path, &request.code)
        .map_err(|e| format!("code staging failed: {e}"))?;
    Ok(StagedCode {
        _dir: dir,
        code_path,
    })
}

fn wait_signal(status: Option<&std::process::ExitStatus>) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.and_then(ExitStatusExt::signal)
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// Periodically reads the container's cgroup, keeping running maxima.
async fn sample_cgroup(
    runtime: String,
    name: String,
    peak: Arc<AtomicU64>,
    pids_hits: Arc<AtomicU64>,
    oom_kills: Arc<AtomicU64>,
) {
    // Resolve the full container id once; the cgroup path derives from it.
    let mut dirs: Vec<PathBuf> = Vec::new();
    for _ in 0..20 {
        tokio::time::sleep(CGROUP_SAMPLE_INTERVAL).await;
        if let Some(id) =
            run_runtime_cmd(&runtime, &["inspect", "-f", "{{.Id}}", &name], RUNTIME_CMD_TIMEOUT)
                .await
        {
            dirs = cgroup_candidates(id.trim());
            break;
        }
    }
    loop {
        for dir in &dirs {
            let usage = cgroup::read_usage(dir);
            if let Some(p) = usage.peak_memory_bytes {
                peak.fetch_max(p, Ordering::Relaxed);
            }
            if let Some(n) = usage.pids_limit_hits {
                pids_hits.fetch_max(n, Ordering::Relaxed);
            }
            if let Some(n) = usage.oom_kills {
                oom_kills.fetch_max(n, Ordering::Relaxed);
            }
        }
        tokio::time::sleep(CGROUP_SAMPLE_INTERVAL).await;
    }
}

/// Known cgroup v2 locations for a container id across runtimes and
/// cgroup drivers.
fn cgroup_candidates(container_id: &str) -> Vec<PathBuf> {
    let root = PathBuf::from("/sys/fs/cgroup");
    vec![
        root.join(format!("system.slice/docker-{container_id}.scope")),
        root.join(format!("docker/{container_id}")),
        root.join(format!("machine.slice/libpod-{container_id}.scope")),
    ]
}

fn write_seccomp_profile() -> Result<NamedTempFile, SandboxBuildError> {
    let file = tempfile::Builder::new()
        .prefix("ixo-seccomp-")
        .suffix(".json")
        .tempfile()
        .map_err(|e| SandboxBuildError::SetupFailed {
            reason: format!("seccomp profile tempfile: {e}"),
        })?;
    let profile = seccomp::runtime_profile_json();
    std::fs::write(file.path(), serde_json::to_vec_pretty(&profile).unwrap_or_default())
        .map_err(|e| SandboxBuildError::SetupFailed {
            reason: format!("seccomp profile write: {e}"),
        })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> IsolationLimits {
        IsolationLimits {
            memory_bytes: 64 * 1024 * 1024,
            process_limit: 8,
            file_handle_limit: 100,
            disk_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn test_isolation_args_full_flag_set() {
        let args = isolation_args(limits(), Path::new("/tmp/p.json"), Some("ixo-sandbox"));
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 67108864"));
        assert!(joined.contains("--memory-swap 67108864"));
        assert!(joined.contains("--pids-limit 8"));
        assert!(joined.contains("--ulimit nofile=100:100"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--security-opt seccomp=/tmp/p.json"));
        assert!(joined.contains("--security-opt apparmor=ixo-sandbox"));
        assert!(joined.contains("size=1048576"));
    }

    #[test]
    fn test_isolation_args_without_apparmor() {
        let args = isolation_args(limits(), Path::new("/tmp/p.json"), None);
        assert!(!args.join(" ").contains("apparmor"));
    }

    #[test]
    fn test_isolation_args_deterministic() {
        let a = isolation_args(limits(), Path::new("/tmp/p.json"), None);
        let b = isolation_args(limits(), Path::new("/tmp/p.json"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_container_name_from_trace() {
        assert_eq!(container_name("abc-123"), "ixo-abc-123");
    }

    #[test]
    fn test_cgroup_candidates_cover_runtimes() {
        let dirs = cgroup_candidates("deadbeef");
        assert!(dirs
            .iter()
            .any(|d| d.ends_with("system.slice/docker-deadbeef.scope")));
        assert!(dirs.iter().any(|d| d.ends_with("docker/deadbeef")));
        assert!(dirs
            .iter()
            .any(|d| d.ends_with("machine.slice/libpod-deadbeef.scope")));
    }

    #[test]
    fn test_stage_code_writes_program() {
        let request = ExecutionRequest {
            code: "print(1)\n".to_string(),
            timeout: Duration::from_secs(1),
            memory_bytes: 1,
            process_limit: 1,
            file_handle_limit: 1,
            output_cap: 1,
            disk_bytes: 1,
            trace_id: "t1".to_string(),
        };
        let staged = stage_code(&request).unwrap();
        let written = std::fs::read_to_string(&staged.code_path).unwrap();
        assert_eq!(written, "print(1)\n");
    }

    #[test]
    fn test_seccomp_profile_file_is_valid_json() {
        let file = write_seccomp_profile().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["defaultAction"], "SCMP_ACT_ERRNO");
    }
}
