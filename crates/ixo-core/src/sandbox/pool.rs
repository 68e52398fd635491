//! Optional pre-launched container pool.
//!
//! Containers are launched quiescent (`sleep infinity`) with the full
//! isolation flag set and leased exclusively per call; the code file is
//! copied in and run with `exec`. A container that observed anything
//! other than a clean `completed` outcome is destroyed instead of being
//! returned - a suspect environment is never reused.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::container::{run_runtime_cmd, stage_code, IsolationLimits};
use super::output::drain_opt;
use super::{
    classify_exit, stderr_indicates_pids_exhaustion, ExecutionRequest, ExecutionResult,
    ExecutionStatus, Lifecycle, GRACE,
};
use crate::telemetry::{AuditEvent, AuditSink, Metrics};

/// Timeout for pool management commands (launch, cp, rm).
const POOL_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code `docker exec` reports for a SIGKILLed process.
const SIGKILL_EXIT: i32 = 137;

/// A pool of idle, quiescent containers.
#[derive(Debug)]
pub struct ContainerPool {
    runtime: String,
    image: String,
    capacity: usize,
    seccomp_profile: PathBuf,
    apparmor_profile: Option<&'static str>,
    metrics: Arc<Metrics>,
    idle: Mutex<Vec<String>>,
}

impl ContainerPool {
    /// Creates an empty pool; containers launch lazily on first lease.
    #[must_use]
    pub fn new(
        runtime: String,
        image: String,
        capacity: usize,
        seccomp_profile: PathBuf,
        apparmor_profile: Option<&'static str>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runtime,
            image,
            capacity,
            seccomp_profile,
            apparmor_profile,
            metrics,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Number of idle containers right now.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn lease(&self, limits: IsolationLimits) -> Result<String, String> {
        if let Some(name) = self.idle.lock().await.pop() {
            self.metrics.pool_idle_set(self.idle_count().await);
            return Ok(name);
        }
        self.launch_one(limits).await
    }

    async fn release(&self, name: String, clean: bool) {
        if clean {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.capacity {
                idle.push(name);
                let count = idle.len();
                drop(idle);
                self.metrics.pool_idle_set(count);
                return;
            }
        }
        self.destroy(&name).await;
    }

    async fn destroy(&self, name: &str) {
        let _ = run_runtime_cmd(&self.runtime, &["rm", "-f", name], POOL_CMD_TIMEOUT).await;
        self.metrics.containers_delta(-1);
        self.metrics.pool_idle_set(self.idle_count().await);
    }

    async fn launch_one(&self, limits: IsolationLimits) -> Result<String, String> {
        let name = format!("ixo-pool-{}", uuid::Uuid::new_v4());
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
            "--workdir".to_string(),
            "/scratch".to_string(),
        ];
        args.extend(super::container::isolation_args(
            limits,
            &self.seccomp_profile,
            self.apparmor_profile,
        ));
        args.push(self.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match run_runtime_cmd(&self.runtime, &arg_refs, POOL_CMD_TIMEOUT).await {
            Some(_) => {
                self.metrics.containers_delta(1);
                debug!(container = %name, "pool container launched");
                Ok(name)
            }
            None => Err("pool container launch failed".to_string()),
        }
    }

    /// Runs a request in a leased container.
    pub(crate) async fn execute(
        &self,
        request: &ExecutionRequest,
        interpreter: &[String],
        audit: &AuditSink,
    ) -> ExecutionResult {
        let limits = IsolationLimits::from_request(request);
        let name = match self.lease(limits).await {
            Ok(name) => name,
            Err(reason) => return ExecutionResult::internal(reason),
        };

        let staged = match stage_code(request) {
            Ok(staged) => staged,
            Err(reason) => {
                self.release(name, true).await;
                return ExecutionResult::internal(reason);
            }
        };
        let dest = format!("{name}:/scratch/main.py");
        if run_runtime_cmd(
            &self.runtime,
            &["cp", &staged.code_path.display().to_string(), &dest],
            POOL_CMD_TIMEOUT,
        )
        .await
        .is_none()
        {
            self.destroy(&name).await;
            return ExecutionResult::internal("code copy into pooled container failed");
        }

        let mut args: Vec<String> = vec!["exec".to_string(), name.clone()];
        args.extend(interpreter.iter().cloned());
        args.push("/scratch/main.py".to_string());

        let started = Instant::now();
        let mut child = match Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.destroy(&name).await;
                return ExecutionResult::internal(format!("exec spawn failed: {e}"));
            }
        };
        let _ = audit.emit(AuditEvent::new(
            Lifecycle::Running.event(),
            request.trace_id.clone(),
            "launched_pooled",
        ));

        let cap = request.output_cap;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(drain_opt(stdout, cap));
        let stderr_task = tokio::spawn(drain_opt(stderr, cap));

        let (deadline_hit, wait_status) = match timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => (false, Some(status)),
            Ok(Err(e)) => {
                warn!(error = %e, "pooled exec wait failed");
                (false, None)
            }
            Err(_) => {
                let _ = audit.emit(AuditEvent::new(
                    Lifecycle::Killed.event(),
                    request.trace_id.clone(),
                    "timed_out",
                ));
                // Destroying the container kills the exec'd process group.
                self.destroy(&name).await;
                let _ = timeout(GRACE, child.wait()).await;
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
                let _ = audit.emit(AuditEvent::new(
                    Lifecycle::Reaped.event(),
                    request.trace_id.clone(),
                    "timed_out",
                ));
                return ExecutionResult {
                    status: ExecutionStatus::TimedOut,
                    exit_code: None,
                    stdout: stdout_stream,
                    stderr: stderr_stream,
                    wall_time_ms: u64::try_from(started.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                    peak_memory_bytes: None,
                };
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

        let exit_code = wait_status.as_ref().and_then(std::process::ExitStatus::code);
        // A SIGKILL inside the container without our deadline firing is
        // the memory controller; the exec client cannot observe OOM
        // directly.
        let oom_killed = !deadline_hit
            && (exit_code == Some(SIGKILL_EXIT) || stderr_stream.text.contains("MemoryError"));
        let pids_exhausted = exit_code.is_some_and(|c| c != 0)
            && stderr_indicates_pids_exhaustion(&stderr_stream.text);

        let (status, exit_code) =
            classify_exit(exit_code, None, deadline_hit, oom_killed, pids_exhausted);
        let clean = matches!(status, ExecutionStatus::Completed);
        let _ = audit.emit(AuditEvent::new(
            Lifecycle::Reaped.event(),
            request.trace_id.clone(),
            status.name(),
        ));
        self.release(name, clean).await;

        ExecutionResult {
            status,
            exit_code,
            stdout: stdout_stream,
            stderr: stderr_stream,
            wall_time_ms,
            peak_memory_bytes: None,
        }
    }

    /// Destroys every idle container. Called at shutdown.
    pub async fn drain(&self) {
        let names: Vec<String> = self.idle.lock().await.drain(..).collect();
        for name in names {
            self.destroy(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Metrics;

    fn pool() -> ContainerPool {
        ContainerPool::new(
            "docker".to_string(),
            "python:3.11-slim".to_string(),
            2,
            PathBuf::from("/tmp/profile.json"),
            None,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_release_clean_returns_to_pool() {
        let p = pool();
        p.release("c1".to_string(), true).await;
        assert_eq!(p.idle_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_over_capacity_destroys() {
        let p = pool();
        p.release("c1".to_string(), true).await;
        p.release("c2".to_string(), true).await;
        // Third clean release exceeds capacity; the destroy path runs the
        // runtime which is absent here, but bookkeeping must not grow.
        p.release("c3".to_string(), true).await;
        assert_eq!(p.idle_count().await, 2);
    }

    #[tokio::test]
    async fn test_suspect_container_never_returns() {
        let p = pool();
        p.release("c1".to_string(), false).await;
        assert_eq!(p.idle_count().await, 0);
    }
}
