//! Wire-level error taxonomy.
//!
//! Every failure that crosses the response boundary is one of a small,
//! closed set of codes. The taxonomy is split into four kinds with
//! distinct propagation rules:
//!
//! - **Validation** - detected before any side effect; returned verbatim,
//!   no failure counter increments.
//! - **Isolation** - the sandbox is the authoritative source; the matching
//!   counter increments and the outcome is never retried.
//! - **Infrastructure** - transient; in hybrid mode the orchestrator falls
//!   back once to the protocol collaborator.
//! - **Overload** - admission control; callers retry after backoff.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error code, driving propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected before any side effect.
    Validation,
    /// Authoritative sandbox outcome.
    Isolation,
    /// Transient infrastructure failure.
    Infrastructure,
    /// Concurrency cap reached.
    Overload,
}

/// The closed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorCode {
    /// Malformed request (bad intent name, non-object params).
    InvalidRequest,
    /// The sandbox refused to run the program.
    SandboxRejection,
    /// The wall-clock deadline expired.
    TimedOut,
    /// A context write exceeded the per-value size ceiling.
    PayloadTooLarge,
    /// Estimated token cost exceeds the per-request budget.
    TokenLimitExceeded,
    /// The concurrency cap and admission queue are both full.
    Overloaded,
    /// The intent has no entry in the capability index.
    UnknownIntent,
    /// The remote key-value backend is unreachable.
    BackendUnavailable,
    /// Unclassified internal failure.
    InternalError,
}

impl ErrorCode {
    /// Numeric wire code carried in the response `error.code` field.
    #[must_use]
    pub const fn wire_code(self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SandboxRejection => 403,
            Self::TimedOut => 408,
            Self::PayloadTooLarge => 413,
            Self::TokenLimitExceeded | Self::Overloaded => 429,
            Self::InternalError => 500,
            Self::UnknownIntent => 501,
            Self::BackendUnavailable => 503,
        }
    }

    /// Snake-case name used in metrics labels and audit records.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::SandboxRejection => "sandbox_rejection",
            Self::TimedOut => "timed_out",
            Self::PayloadTooLarge => "payload_too_large",
            Self::TokenLimitExceeded => "token_limit_exceeded",
            Self::Overloaded => "overloaded",
            Self::UnknownIntent => "unknown_intent",
            Self::BackendUnavailable => "backend_unavailable",
            Self::InternalError => "internal_error",
        }
    }

    /// Propagation classification for this code.
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::InvalidRequest
            | Self::PayloadTooLarge
            | Self::TokenLimitExceeded
            | Self::UnknownIntent => ErrorKind::Validation,
            Self::SandboxRejection | Self::TimedOut => ErrorKind::Isolation,
            Self::BackendUnavailable | Self::InternalError => ErrorKind::Infrastructure,
            Self::Overloaded => ErrorKind::Overload,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A wire error: code plus a human-readable message.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct IxoError {
    /// The taxonomy code.
    pub code: ErrorCode,
    /// Operator-facing description. Never contains captured program output.
    pub message: String,
}

impl IxoError {
    /// Creates an error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an [`ErrorCode::InternalError`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Shorthand for an [`ErrorCode::InvalidRequest`].
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_match_taxonomy() {
        assert_eq!(ErrorCode::InvalidRequest.wire_code(), 400);
        assert_eq!(ErrorCode::SandboxRejection.wire_code(), 403);
        assert_eq!(ErrorCode::TimedOut.wire_code(), 408);
        assert_eq!(ErrorCode::PayloadTooLarge.wire_code(), 413);
        assert_eq!(ErrorCode::TokenLimitExceeded.wire_code(), 429);
        assert_eq!(ErrorCode::Overloaded.wire_code(), 429);
        assert_eq!(ErrorCode::InternalError.wire_code(), 500);
        assert_eq!(ErrorCode::UnknownIntent.wire_code(), 501);
        assert_eq!(ErrorCode::BackendUnavailable.wire_code(), 503);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(ErrorCode::UnknownIntent.kind(), ErrorKind::Validation);
        assert_eq!(ErrorCode::TimedOut.kind(), ErrorKind::Isolation);
        assert_eq!(
            ErrorCode::BackendUnavailable.kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(ErrorCode::Overloaded.kind(), ErrorKind::Overload);
    }

    #[test]
    fn test_serde_names_are_snake_case() {
        let json = serde_json::to_string(&ErrorCode::TokenLimitExceeded).unwrap();
        assert_eq!(json, "\"token_limit_exceeded\"");
        let back: ErrorCode = serde_json::from_str("\"backend_unavailable\"").unwrap();
        assert_eq!(back, ErrorCode::BackendUnavailable);
    }

    #[test]
    fn test_display_uses_name() {
        assert_eq!(ErrorCode::SandboxRejection.to_string(), "sandbox_rejection");
        let err = IxoError::new(ErrorCode::TimedOut, "deadline expired");
        assert_eq!(err.to_string(), "timed_out: deadline expired");
    }
}
