//! JSON-over-Unix-socket front end.
//!
//! Frames are a 4-byte big-endian length followed by a JSON body. Each
//! request frame is an `IntentRequest`; each response frame is a
//! `Response`. A request arriving while the readiness gate is closed is
//! answered with `internal_error` without touching the orchestrator.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ixo_core::error::ErrorCode;
use ixo_core::protocol::{IntentRequest, Response, ResponseMetadata};
use ixo_core::Orchestrator;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::readiness::ReadinessGate;

/// Maximum frame size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Runs the socket server until the task is cancelled.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn run(
    socket_path: &Path,
    orchestrator: Arc<Orchestrator>,
    gate: ReadinessGate,
) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;
    info!(path = %socket_path.display(), "intent socket listening");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let orchestrator = Arc::clone(&orchestrator);
                let gate = gate.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, orchestrator, gate).await {
                        debug!(error = %e, "connection handler finished with error");
                    }
                });
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
    gate: ReadinessGate,
) -> Result<()> {
    loop {
        let Some(frame) = read_frame(&mut stream).await? else {
            return Ok(());
        };
        let response = dispatch(&frame, &orchestrator, &gate).await;
        let body = serde_json::to_vec(&response).context("response serialization")?;
        write_frame(&mut stream, &body).await?;
    }
}

/// Parses and executes one request frame.
pub async fn dispatch(
    frame: &[u8],
    orchestrator: &Orchestrator,
    gate: &ReadinessGate,
) -> Response {
    let request: IntentRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => {
            return Response::failure(
                ErrorCode::InvalidRequest,
                format!("malformed request: {e}"),
                empty_metadata(),
            );
        }
    };
    if !gate.is_ready() {
        return Response::failure(
            ErrorCode::InternalError,
            "container runtime unavailable, not accepting requests",
            empty_metadata(),
        );
    }
    orchestrator.execute(&request).await
}

fn empty_metadata() -> ResponseMetadata {
    ResponseMetadata {
        tokens_used: 0,
        execution_time_ms: 0,
        cache_hit: false,
        mode: "none".to_string(),
        trace_id: String::new(),
    }
}

/// Reads one frame; `None` on clean EOF.
async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("frame length read"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_MESSAGE_SIZE, "frame of {len} bytes exceeds limit");
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.context("frame body read")?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut UnixStream, body: &[u8]) -> Result<()> {
    anyhow::ensure!(
        body.len() <= MAX_MESSAGE_SIZE,
        "response frame exceeds limit"
    );
    let len = u32::try_from(body.len()).context("frame length overflow")?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixo_core::config::{ExecutionMode, Flags, SandboxBackend};

    async fn orchestrator() -> Arc<Orchestrator> {
        let flags = Flags {
            mode: ExecutionMode::CodeExecution,
            sandbox_backend: SandboxBackend::InProcess,
            interpreter: vec!["sh".to_string()],
            ..Flags::default()
        };
        Arc::new(Orchestrator::builder(flags).build().await.unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_rejects_malformed_json() {
        let orchestrator = orchestrator().await;
        let gate = ReadinessGate::new(true);
        let response = dispatch(b"{not json", &orchestrator, &gate).await;
        assert!(response.is_error());
        assert_eq!(response.error.as_ref().unwrap().code, 400);
    }

    #[tokio::test]
    async fn test_dispatch_refuses_when_not_ready() {
        let orchestrator = orchestrator().await;
        let gate = ReadinessGate::new(false);
        let frame = serde_json::to_vec(&IntentRequest {
            intent: "echo".to_string(),
            params: serde_json::Map::new(),
            session_id: None,
        })
        .unwrap();
        let response = dispatch(&frame, &orchestrator, &gate).await;
        assert!(response.is_error());
        assert_eq!(response.error.as_ref().unwrap().code, 500);
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ixo.sock");
        let orchestrator = orchestrator().await;
        let gate = ReadinessGate::new(true);

        let server_path = path.clone();
        let server = tokio::spawn(async move {
            let _ = run(&server_path, orchestrator, gate).await;
        });

        // Wait for the socket to appear.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut client = UnixStream::connect(&path).await.unwrap();
        let request = serde_json::to_vec(&IntentRequest {
            intent: "definitely_unknown".to_string(),
            params: serde_json::Map::new(),
            session_id: None,
        })
        .unwrap();
        let len = u32::try_from(request.len()).unwrap();
        client.write_all(&len.to_be_bytes()).await.unwrap();
        client.write_all(&request).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let body_len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; body_len];
        client.read_exact(&mut body).await.unwrap();

        let response: Response = serde_json::from_slice(&body).unwrap();
        assert!(response.is_error());
        assert_eq!(response.error.unwrap().code, 501);

        server.abort();
    }
}
