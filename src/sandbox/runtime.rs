//! The container runtime contract consumed by the executor.
//!
//! Anything that can create, start, wait on and destroy an isolated
//! execution unit can back the sandbox. [`DockerRuntime`](super::DockerRuntime)
//! is the production implementation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::RuntimeError;

/// Everything the runtime needs to create one execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Container name, unique per request.
    pub name: String,
    pub image: String,
    /// Argument vector executed directly (never through a shell).
    pub command: Vec<String>,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub network_disabled: bool,
}

/// A chunk of demultiplexed container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Output stream returned by [`ContainerRuntime::attach_output`].
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, RuntimeError>> + Send>>;

/// Lifecycle operations on isolated execution units.
///
/// `kill` and `remove` are best-effort: they report failures as an
/// advisory `Result` that callers log and never escalate. Removing an
/// instance that no longer exists must be reported as
/// [`RuntimeError::NotFound`] (or success), never as a hard failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is available locally, pulling it on a cache miss.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create (but do not start) an instance named `spec.name`; returns
    /// the runtime-assigned id. Every other call addresses the instance by
    /// its name, which is known before the create completes.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, RuntimeError>;

    /// Extract a tar archive into `dest_dir` inside a created instance.
    async fn upload_archive(
        &self,
        instance_id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError>;

    /// Attach to stdout/stderr. Must be called before `start` so no
    /// output is lost.
    async fn attach_output(&self, instance_id: &str) -> Result<OutputStream, RuntimeError>;

    async fn start(&self, instance_id: &str) -> Result<(), RuntimeError>;

    /// Block until the instance reaches a terminal state; returns the exit
    /// status reported by the wait call. Cancel by dropping the future.
    async fn wait_terminal(&self, instance_id: &str) -> Result<i64, RuntimeError>;

    /// Read the exit code from the instance's final state.
    async fn inspect_exit_code(&self, instance_id: &str) -> Result<i64, RuntimeError>;

    /// Force-stop the instance. Best-effort.
    async fn kill(&self, instance_id: &str) -> Result<(), RuntimeError>;

    /// Force-remove the instance. Best-effort.
    async fn remove(&self, instance_id: &str) -> Result<(), RuntimeError>;
}
