//! In-process sandbox tier. Development only.
//!
//! Runs the interpreter as a direct child with the wall-clock deadline
//! and bounded output capture, but no isolation: no namespaces, no
//! seccomp, no resource controllers. The production guard against this
//! tier lives at [`super::Sandbox::from_flags`]; this type assumes it has
//! already been allowed to exist.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use super::container::stage_code;
use super::output::drain_opt;
use super::{
    classify_exit, CodePolicy, ExecutionRequest, ExecutionResult, ExecutionStatus, Lifecycle,
    GRACE,
};
use crate::config::Flags;
use crate::telemetry::{AuditEvent, AuditSink, Metrics};

/// Direct-child sandbox.
#[derive(Debug)]
pub struct InProcessSandbox {
    interpreter: Vec<String>,
    policy: CodePolicy,
    metrics: Arc<Metrics>,
    audit: AuditSink,
}

impl InProcessSandbox {
    /// Builds the tier.
    #[must_use]
    pub fn new(flags: &Flags, metrics: Arc<Metrics>, audit: AuditSink) -> Self {
        Self {
            interpreter: flags.interpreter.clone(),
            policy: CodePolicy::default(),
            metrics,
            audit,
        }
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

        let staged = match stage_code(request) {
            Ok(staged) => staged,
            Err(reason) => return ExecutionResult::internal(reason),
        };
        let scratch = staged
            .code_path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);

        let started = Instant::now();
        let mut child = match Command::new(&self.interpreter[0])
            .args(&self.interpreter[1..])
            .arg(&staged.code_path)
            .current_dir(&scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle(Lifecycle::Reaped, request, "internal_error");
                return ExecutionResult::internal(format!("interpreter spawn failed: {e}"));
            }
        };
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
                let _ = child.start_kill();
                let status = timeout(GRACE, child.wait()).await.ok().and_then(Result::ok);
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

        let exit_code = wait_status.as_ref().and_then(std::process::ExitStatus::code);
        let signal = exit_signal(wait_status.as_ref());
        let (status, exit_code) = classify_exit(exit_code, signal, deadline_hit, false, false);
        self.lifecycle(Lifecycle::Reaped, request, status.name());

        ExecutionResult {
            status,
            exit_code,
            stdout: stdout_stream,
            stderr: stderr_stream,
            wall_time_ms,
            peak_memory_bytes: None,
        }
    }
}

fn exit_signal(status: Option<&std::process::ExitStatus>) -> Option<i32> {
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sandbox() -> InProcessSandbox {
        let flags = Flags {
            interpreter: vec!["sh".to_string()],
            ..Flags::default()
        };
        InProcessSandbox::new(
            &flags,
            Arc::new(Metrics::new().unwrap()),
            AuditSink::spawn(None),
        )
    }

    fn request(code: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            timeout,
            memory_bytes: 64 << 20,
            process_limit: 8,
            file_handle_limit: 32,
            output_cap: 1024,
            disk_bytes: 1 << 20,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn test_simple_completion() {
        let result = sandbox()
            .execute(&request("echo hi", Duration::from_secs(10)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.text, "hi\n");
        assert!(!result.stdout.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_still_completed() {
        let result = sandbox()
            .execute(&request("exit 3", Duration::from_secs(10)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_deadline_kills_and_reaps() {
        let started = Instant::now();
        let result = sandbox()
            .execute(&request("sleep 30", Duration::from_millis(200)))
            .await;
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.exit_code, None);
        // Wall time stays inside deadline + grace.
        assert!(started.elapsed() < Duration::from_millis(200) + GRACE + GRACE);
        assert!(result.wall_time_ms >= 200);
    }

    #[tokio::test]
    async fn test_output_truncation_flag() {
        // 4 KiB of output against a 1 KiB cap.
        let result = sandbox()
            .execute(&request(
                "i=0; while [ $i -lt 256 ]; do echo 0123456789abcdef; i=$((i+1)); done",
                Duration::from_secs(10),
            ))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.stdout.truncated);
        assert_eq!(result.stdout.text.len(), 1024);
        assert!(result.stdout.total_bytes > 1024);
    }

    #[tokio::test]
    async fn test_policy_screen_rejects() {
        let result = sandbox()
            .execute(&request("eval('x')", Duration::from_secs(1)))
            .await;
        assert!(matches!(result.status, ExecutionStatus::Rejected { .. }));
    }
}
