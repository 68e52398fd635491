//! ixo-daemon - intent execution daemon.
//!
//! Wires the orchestrator to its serving surfaces: a Unix-socket JSON
//! front end, a Prometheus scrape endpoint, the readiness probe loop,
//! and a coarse expiry sweep. Flags come from the `IXO_FLAGS` environment
//! variable as JSON; config-file handling belongs to the embedder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ixo_core::config::Flags;
use ixo_core::Orchestrator;
use ixo_daemon::readiness::{self, ReadinessGate};
use ixo_daemon::{ipc, serve};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default socket path when none is configured.
const DEFAULT_SOCKET: &str = "/run/ixo/intent.sock";

/// Interval for the context-store expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn load_flags() -> Result<Flags> {
    match std::env::var("IXO_FLAGS") {
        Ok(raw) => serde_json::from_str(&raw).context("IXO_FLAGS is not valid flags JSON"),
        Err(_) => Ok(Flags::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let flags = load_flags()?;
    flags.validate().context("invalid configuration")?;
    info!(
        mode = flags.mode.name(),
        backend = flags.sandbox_backend.name(),
        "starting ixo daemon"
    );

    let orchestrator = Arc::new(
        Orchestrator::builder(flags.clone())
            .build()
            .await
            .context("orchestrator construction failed")?,
    );

    // Readiness: start closed when a runtime is required, so the first
    // successful probe opens the gate.
    let gate = ReadinessGate::new(!readiness::requires_runtime(&flags));
    tokio::spawn(readiness::probe_loop(flags.clone(), gate.clone()));

    if let Some(addr) = flags.metrics_listen_addr.clone() {
        let state = serve::HttpState {
            metrics: Arc::clone(orchestrator.metrics()),
            gate: gate.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = serve::serve(&addr, state).await {
                warn!(error = %e, "metrics endpoint failed");
            }
        });
    }

    // Coarse expiry sweep for the in-process store and session registry.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let purged = orchestrator.store().purge_expired().await;
                let swept = orchestrator.sessions().sweep().await;
                if purged > 0 || swept > 0 {
                    info!(purged, swept, "expiry sweep");
                }
            }
        });
    }

    let socket_path = std::env::var("IXO_SOCKET")
        .map_or_else(|_| PathBuf::from(DEFAULT_SOCKET), PathBuf::from);

    let mut sigterm = signal(SignalKind::terminate()).context("sigterm handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("sigint handler")?;

    tokio::select! {
        result = ipc::run(&socket_path, Arc::clone(&orchestrator), gate) => {
            result.context("intent socket server failed")?;
        }
        _ = sigterm.recv() => info!("SIGTERM received, draining"),
        _ = sigint.recv() => info!("SIGINT received, draining"),
    }

    Ok(())
}
