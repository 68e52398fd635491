//! Bounded output capture.
//!
//! Each child stream gets a dedicated drain task that reads continuously
//! until EOF. Bytes beyond the cap are discarded rather than buffered:
//! the pipe keeps draining so a chatty child can never block on a full
//! pipe and outlive its deadline that way.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::telemetry::redact;

/// Read chunk size for drain loops.
const DRAIN_CHUNK: usize = 8 * 1024;

/// One captured stream after redaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedStream {
    /// Captured text, lossily decoded and secret-redacted. At most the
    /// configured cap of raw bytes contributed to it.
    pub text: String,
    /// Set when bytes beyond the cap were discarded.
    pub truncated: bool,
    /// Total bytes the child wrote, including discarded ones.
    pub total_bytes: u64,
}

/// Raw capture before redaction.
#[derive(Debug)]
pub(crate) struct RawCapture {
    pub bytes: Bytes,
    pub truncated: bool,
    pub total_bytes: u64,
}

impl RawCapture {
    pub(crate) fn into_stream(self) -> CapturedStream {
        CapturedStream {
            text: redact::redact_bytes(&self.bytes),
            truncated: self.truncated,
            total_bytes: self.total_bytes,
        }
    }
}

/// Drains a stream to EOF, keeping at most `cap` bytes.
pub(crate) async fn drain_raw<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> RawCapture {
    let mut kept = BytesMut::with_capacity(DRAIN_CHUNK.min(cap.max(1)));
    let mut chunk = vec![0u8; DRAIN_CHUNK];
    let mut total: u64 = 0;
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            // Treat read errors as EOF; the child is being torn down.
            Err(_) => break,
        }
    }

    RawCapture {
        bytes: kept.freeze(),
        truncated,
        total_bytes: total,
    }
}

/// Drains a stream and produces the redacted capture.
pub async fn drain_stream<R: AsyncRead + Unpin>(reader: R, cap: usize) -> CapturedStream {
    drain_raw(reader, cap).await.into_stream()
}

/// Drains an optional child pipe. A pipe that was never handed over
/// (spawn raced teardown) yields an empty capture.
pub(crate) async fn drain_opt<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> RawCapture {
    match reader {
        Some(reader) => drain_raw(reader, cap).await,
        None => RawCapture {
            bytes: Bytes::new(),
            truncated: false,
            total_bytes: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_under_cap_not_truncated() {
        let data = b"hello world\n".to_vec();
        let captured = drain_stream(&data[..], 64).await;
        assert_eq!(captured.text, "hello world\n");
        assert!(!captured.truncated);
        assert_eq!(captured.total_bytes, 12);
    }

    #[tokio::test]
    async fn test_exactly_at_cap_not_truncated() {
        let data = vec![b'x'; 64];
        let captured = drain_stream(&data[..], 64).await;
        assert_eq!(captured.text.len(), 64);
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_one_byte_over_cap_truncates() {
        let data = vec![b'x'; 65];
        let captured = drain_stream(&data[..], 64).await;
        assert_eq!(captured.text.len(), 64);
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 65);
    }

    #[tokio::test]
    async fn test_overflow_is_still_fully_drained() {
        // 1 MiB of input against a 1 KiB cap: the drain must consume all
        // of it so the writer never blocks.
        let data = vec![b'y'; 1 << 20];
        let captured = drain_stream(&data[..], 1024).await;
        assert_eq!(captured.total_bytes, 1 << 20);
        assert_eq!(captured.text.len(), 1024);
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn test_capture_is_redacted() {
        let data = b"token=abcdefghijklmnop1234\n".to_vec();
        let captured = drain_stream(&data[..], 1024).await;
        assert!(!captured.text.contains("abcdefghijklmnop1234"));
        assert!(captured.text.contains("REDACTED"));
    }
}
