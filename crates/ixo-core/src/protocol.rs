//! Wire request and response shapes.
//!
//! Responses carry the fixed protocol string `"2.0"` and either a
//! `result` (with embedded metadata) or an `error` (with metadata at the
//! top level). Framing is the embedder's choice; this module only shapes
//! the JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, IxoError};

/// Fixed protocol version string.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Schema URL carried on success responses.
pub const RESPONSE_SCHEMA: &str = "https://ixo.dev/schemas/response/v2";

/// Maximum accepted intent name length.
pub const MAX_INTENT_LEN: usize = 128;

/// One inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    /// Intent name.
    pub intent: String,
    /// Parameter bag.
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    /// Optional session namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl IntentRequest {
    /// Structural validation, applied before any side effect.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_request` error for an empty or oversized
    /// intent name.
    pub fn validate(&self) -> Result<(), IxoError> {
        if self.intent.is_empty() {
            return Err(IxoError::invalid("intent name is empty"));
        }
        if self.intent.len() > MAX_INTENT_LEN {
            return Err(IxoError::invalid(format!(
                "intent name exceeds {MAX_INTENT_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Per-response metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// Estimated token cost of the request.
    pub tokens_used: u64,
    /// End-to-end latency in milliseconds.
    pub execution_time_ms: u64,
    /// Whether the response came from the cache.
    pub cache_hit: bool,
    /// Path actually taken: `code_execution` or `protocol`.
    pub mode: String,
    /// Per-call identifier.
    pub trace_id: String,
}

/// The cacheable part of a successful result: everything except the
/// per-call metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultPayload {
    /// Job status (`completed`, `timed_out`, `resource_exceeded`, ...).
    pub status: String,
    /// Resource kind for `resource_exceeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Job output.
    pub data: Value,
}

/// Result body: payload plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBody {
    /// The cacheable payload.
    #[serde(flatten)]
    pub payload: ResultPayload,
    /// Per-call metadata.
    pub metadata: ResponseMetadata,
}

/// Error body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Numeric wire code.
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

/// One outbound response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always [`PROTOCOL_VERSION`].
    pub protocol: String,
    /// Present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultBody>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Schema URL, success only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Top-level metadata, failure only (success carries it inside
    /// `result`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

impl Response {
    /// Builds a success response.
    #[must_use]
    pub fn success(payload: ResultPayload, metadata: ResponseMetadata) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            result: Some(ResultBody { payload, metadata }),
            error: None,
            schema: Some(RESPONSE_SCHEMA.to_string()),
            metadata: None,
        }
    }

    /// Builds a failure response.
    #[must_use]
    pub fn failure(code: ErrorCode, message: impl Into<String>, metadata: ResponseMetadata) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(ErrorBody {
                code: code.wire_code(),
                message: message.into(),
            }),
            schema: None,
            metadata: Some(metadata),
        }
    }

    /// Whether this is a failure response.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The metadata, wherever it lives.
    #[must_use]
    pub fn meta(&self) -> Option<&ResponseMetadata> {
        self.result
            .as_ref()
            .map(|r| &r.metadata)
            .or(self.metadata.as_ref())
    }
}
