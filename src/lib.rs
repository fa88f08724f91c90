//! Sandboxed code execution service.
//!
//! Runs untrusted programs in disposable, network-isolated containers,
//! guarded by per-caller admission control and a shutdown sweep that
//! reclaims every container still alive when the process stops.

pub mod api;
pub mod benchmark;
pub mod config;
pub mod error;
pub mod limiter;
pub mod llm;
pub mod metrics;
pub mod sandbox;
pub mod shutdown;

pub use config::Config;
pub use error::{ConfigError, ExecutionError, FailureKind, LlmError, RuntimeError};
