//! Sandboxed execution of untrusted programs in disposable containers.
//!
//! - [`ContainerRuntime`]: the runtime contract, with [`DockerRuntime`] as
//!   the bollard-backed implementation
//! - [`SandboxExecutor`]: runs one request end to end
//! - [`InstanceRegistry`]: tracks live containers for the shutdown sweep

mod docker;
mod executor;
mod payload;
mod registry;
mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::{DockerRuntime, connect_docker};
pub use executor::{ExecutionOutput, ExecutionRequest, ExecutionResult, SandboxExecutor};
pub use payload::{PAYLOAD_DIR, Toolchain, build_archive};
pub use registry::{InstanceInfo, InstanceRegistry};
#[cfg(test)]
pub(crate) use registry::destroy_instance;
pub use runtime::{ContainerRuntime, InstanceSpec, OutputChunk, OutputStream};
