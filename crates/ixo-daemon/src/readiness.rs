//! Readiness gate.
//!
//! When the configuration demands the container tier, the process must
//! refuse requests while the container runtime is absent, and recover on
//! its own once the runtime returns. The gate is a shared flag flipped
//! by a probe loop; request paths check it, they never probe themselves.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ixo_core::config::{Flags, SandboxBackend};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

/// Interval between runtime probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared readiness flag.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    ready: Arc<AtomicBool>,
}

impl ReadinessGate {
    /// A gate that starts in the given state.
    #[must_use]
    pub fn new(ready: bool) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(ready)),
        }
    }

    /// Whether requests may be served right now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

/// Whether this configuration depends on a container runtime.
#[must_use]
pub fn requires_runtime(flags: &Flags) -> bool {
    flags.enable_sandbox && flags.sandbox_backend == SandboxBackend::Container
}

/// Probes the runtime once.
pub async fn probe_runtime(runtime: &str) -> bool {
    let result = timeout(
        PROBE_TIMEOUT,
        Command::new(runtime)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status(),
    )
    .await;
    matches!(result, Ok(Ok(status)) if status.success())
}

/// Runs the probe loop, flipping the gate as the runtime comes and goes.
///
/// Configurations that do not need a runtime get a gate that is always
/// ready and no probe loop.
pub async fn probe_loop(flags: Flags, gate: ReadinessGate) {
    if !requires_runtime(&flags) {
        gate.set(true);
        return;
    }
    let mut was_ready: Option<bool> = None;
    loop {
        let ready = probe_runtime(&flags.container_runtime).await;
        gate.set(ready);
        if was_ready != Some(ready) {
            if ready {
                info!(runtime = %flags.container_runtime, "container runtime available, accepting requests");
            } else {
                warn!(runtime = %flags.container_runtime, "container runtime unavailable, refusing requests");
            }
            was_ready = Some(ready);
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}
