//! # ixo-core
//!
//! Core library for ixo - an intent-routed code execution orchestrator.
//!
//! Clients submit a named *intent* plus a JSON parameter bag. The
//! orchestrator looks the intent up in a static capability index,
//! materializes a short program from the capability's template, runs it in
//! a hardened multi-tier sandbox, and returns a structured response - so a
//! language model can drive third-party services by emitting intents
//! instead of consuming large tool schemas.
//!
//! ## Subsystems
//!
//! - **Orchestrator**: routing between code execution, protocol fallback,
//!   and hybrid modes; token budgeting; response caching.
//! - **Sandbox**: per-call isolation with container, syscall-filter, and
//!   (development-only) in-process tiers; hard CPU/memory/PIDs/wall-clock
//!   budgets; bounded output capture.
//! - **Context store**: bounded TTL key-value mapping with in-memory and
//!   remote (Redis) backends; session namespacing.
//! - **Telemetry**: Prometheus counters/histograms/gauges plus a
//!   line-delimited JSON audit log.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ixo_core::capability::CapabilityIndex;
//! use ixo_core::config::Flags;
//! use ixo_core::orchestrator::Orchestrator;
//! use ixo_core::telemetry::Metrics;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let flags = Flags::default();
//! let metrics = Arc::new(Metrics::new()?);
//! let orchestrator = Orchestrator::builder(flags)
//!     .capabilities(CapabilityIndex::builtin())
//!     .metrics(metrics)
//!     .build()
//!     .await?;
//!
//! let _response = orchestrator
//!     .execute_intent("echo", serde_json::json!({"message": "hi"}), None)
//!     .await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod materialize;
pub mod orchestrator;
pub mod protocol;
pub mod sandbox;
pub mod session;
pub mod telemetry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::capability::{CapabilityEntry, CapabilityIndex};
    pub use crate::config::{ContextBackend, ExecutionMode, Flags, SandboxBackend};
    pub use crate::context::ContextStore;
    pub use crate::error::ErrorCode;
    pub use crate::orchestrator::Orchestrator;
    pub use crate::protocol::{IntentRequest, Response};
    pub use crate::sandbox::{ExecutionRequest, ExecutionResult, ExecutionStatus, Sandbox};
    pub use crate::session::SessionRegistry;
    pub use crate::telemetry::Metrics;
}

pub use config::Flags;
pub use error::ErrorCode;
pub use orchestrator::Orchestrator;
