//! Request-to-result pipeline for one sandboxed execution.
//!
//! ```text
//! resolve image ─► build payload ─► ensure image ─► register ─► create
//!        ─► upload source ─► attach ─► start ─► wait ◄─ deadline
//!        ─► drain output ─► inspect ─► teardown (always)
//! ```
//!
//! The container is addressed by the name the executor picks for it, and
//! that name is registered before the create call so the shutdown sweep
//! can reach a container whose create outlives the request. From then on
//! the registration is owned by an [`InstanceGuard`]. The guard is
//! released explicitly on every normal return; if the executing future is
//! dropped instead (client disconnect, server abort), its `Drop` claims the
//! instance and spawns the same teardown. The registry entry is only
//! removed once kill and remove have returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{ExecutionError, RuntimeError};
use crate::sandbox::payload::{PAYLOAD_DIR, Toolchain, build_archive};
use crate::sandbox::registry::{InstanceRegistry, destroy_instance};
use crate::sandbox::runtime::{ContainerRuntime, InstanceSpec, OutputChunk, OutputStream};

/// Minimum time allowed for draining output after the program exits, so
/// a program finishing right at its deadline is not reported as a timeout.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A validated execution request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    language: String,
    source_code: String,
    timeout: Duration,
}

impl ExecutionRequest {
    /// Build a request, rejecting empty source. A zero `timeout` is
    /// accepted here; [`SandboxExecutor::request`] substitutes the default.
    pub fn new(
        language: impl Into<String>,
        source_code: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let source_code = source_code.into();
        if source_code.is_empty() {
            return Err(ExecutionError::EmptySource);
        }
        Ok(Self {
            language: language.into(),
            source_code,
            timeout,
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Captured output of a program that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

/// Flattened outcome: output on success, a failure description otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub failure: Option<String>,
}

impl From<Result<ExecutionOutput, ExecutionError>> for ExecutionResult {
    fn from(outcome: Result<ExecutionOutput, ExecutionError>) -> Self {
        match outcome {
            Ok(output) => Self {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                failure: None,
            },
            Err(e) => Self {
                failure: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Runs untrusted programs in throwaway containers.
pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<InstanceRegistry>,
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<InstanceRegistry>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Validate and normalize caller input into a request, applying the
    /// default timeout for `None`/zero and clamping to the maximum.
    pub fn request(
        &self,
        language: &str,
        source_code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecutionRequest, ExecutionError> {
        ExecutionRequest::new(
            language,
            source_code,
            self.config.effective_timeout(timeout_ms),
        )
    }

    /// Run a request to completion.
    ///
    /// Whatever the outcome, any container created for the request has been
    /// removed from the registry and torn down by the time this returns.
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let image = self
            .config
            .image_for(req.language())
            .ok_or_else(|| ExecutionError::UnsupportedLanguage(req.language().to_string()))?
            .to_string();
        let toolchain = Toolchain::detect(req.language());
        let archive = build_archive(toolchain.file_name(), req.source_code())?;

        let timeout = if req.timeout().is_zero() {
            self.config.default_timeout
        } else {
            req.timeout()
        };
        let started = Instant::now();
        let deadline = started + timeout;

        within_deadline(deadline, timeout, self.runtime.ensure_image(&image))
            .await?
            .map_err(|e| match e {
                RuntimeError::Unavailable(reason) => ExecutionError::RuntimeUnavailable(reason),
                other => ExecutionError::ImagePullFailed {
                    image: image.clone(),
                    reason: other.to_string(),
                },
            })?;

        let spec = InstanceSpec {
            name: format!("gexec-{}", Uuid::new_v4()),
            image,
            command: toolchain.command(),
            memory_bytes: self.config.memory_limit_bytes(),
            cpu_quota: self.config.cpu_quota,
            pids_limit: self.config.pids_limit,
            network_disabled: true,
        };

        let instance_id = spec.name.clone();
        self.registry
            .register(&instance_id, Arc::clone(&self.runtime), req.language());
        let guard = InstanceGuard {
            instance_id: instance_id.clone(),
            runtime: Arc::clone(&self.runtime),
            registry: Arc::clone(&self.registry),
            teardown_timeout: self.config.teardown_timeout,
            claimed: false,
            armed: true,
        };

        {
            let mut create = std::pin::pin!(self.runtime.create_instance(&spec));
            match tokio::time::timeout_at(deadline, create.as_mut()).await {
                Ok(Ok(container_id)) => tracing::debug!(
                    instance_id = %instance_id,
                    container_id = %container_id,
                    language = %req.language(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Created sandbox container"
                ),
                Ok(Err(e)) => {
                    guard.forget();
                    return Err(ExecutionError::from_runtime(
                        e,
                        ExecutionError::InstanceCreateFailed,
                    ));
                }
                Err(_) => {
                    // Let a slow daemon finish the create so the teardown below
                    // finds the container instead of racing it.
                    if tokio::time::timeout(self.config.teardown_timeout, create.as_mut())
                        .await
                        .is_err()
                    {
                        tracing::warn!(instance_id = %instance_id, "Create still pending after timeout");
                    }
                    guard.release().await;
                    return Err(ExecutionError::ExecutionTimeout(timeout));
                }
            }
        }

        let outcome = self
            .run_instance(&instance_id, archive, deadline, timeout)
            .await;

        guard.release().await;

        match &outcome {
            Ok(output) => tracing::info!(
                instance_id = %instance_id,
                language = %req.language(),
                exit_code = output.exit_code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Execution finished"
            ),
            Err(e) => tracing::info!(
                instance_id = %instance_id,
                language = %req.language(),
                kind = %e.kind(),
                error = %e,
                "Execution failed"
            ),
        }

        outcome
    }

    /// Steps that need a registered container. Teardown is the caller's job.
    async fn run_instance(
        &self,
        instance_id: &str,
        archive: Vec<u8>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        within_deadline(
            deadline,
            timeout,
            self.runtime.upload_archive(instance_id, PAYLOAD_DIR, archive),
        )
        .await?
        .map_err(|e| ExecutionError::from_runtime(e, ExecutionError::PayloadFailed))?;

        let output = within_deadline(deadline, timeout, self.runtime.attach_output(instance_id))
            .await?
            .map_err(|e| ExecutionError::from_runtime(e, ExecutionError::AttachFailed))?;

        // Read output concurrently with the wait so a chatty program cannot
        // stall on a full pipe.
        let drain = DrainTask(tokio::spawn(collect_output(output)));

        within_deadline(deadline, timeout, self.runtime.start(instance_id))
            .await?
            .map_err(|e| ExecutionError::from_runtime(e, ExecutionError::StartFailed))?;

        // Completion and wait errors take priority over the deadline when
        // both are ready; exactly one outcome is chosen.
        let wait_status = tokio::select! {
            biased;
            result = self.runtime.wait_terminal(instance_id) => {
                result.map_err(|e| ExecutionError::from_runtime(e, ExecutionError::WaitFailed))?
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ExecutionError::ExecutionTimeout(timeout));
            }
        };

        let drain_deadline = deadline.max(Instant::now() + DRAIN_GRACE);
        let (stdout, stderr) = drain
            .finish(drain_deadline)
            .await
            .map_err(|e| match e {
                DrainError::TimedOut => ExecutionError::ExecutionTimeout(timeout),
                DrainError::Failed(reason) => ExecutionError::OutputReadFailed(reason),
            })?;

        let exit_code = tokio::time::timeout(
            self.config.teardown_timeout,
            self.runtime.inspect_exit_code(instance_id),
        )
        .await
        .map_err(|_| ExecutionError::InspectFailed("inspect timed out".to_string()))?
        .map_err(|e| ExecutionError::from_runtime(e, ExecutionError::InspectFailed))?;

        if exit_code != wait_status {
            tracing::debug!(
                instance_id = %instance_id,
                wait_status,
                exit_code,
                "Wait status and inspected exit code differ"
            );
        }

        Ok(ExecutionOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Bound a pipeline step by the request deadline.
async fn within_deadline<T>(
    deadline: Instant,
    timeout: Duration,
    step: impl Future<Output = T>,
) -> Result<T, ExecutionError> {
    tokio::time::timeout_at(deadline, step)
        .await
        .map_err(|_| ExecutionError::ExecutionTimeout(timeout))
}

async fn collect_output(mut stream: OutputStream) -> Result<(Vec<u8>, Vec<u8>), RuntimeError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            OutputChunk::Stdout(bytes) => stdout.extend_from_slice(&bytes),
            OutputChunk::Stderr(bytes) => stderr.extend_from_slice(&bytes),
        }
    }
    Ok((stdout, stderr))
}

enum DrainError {
    TimedOut,
    Failed(String),
}

/// Output reader task, aborted if dropped before it finishes.
struct DrainTask(JoinHandle<Result<(Vec<u8>, Vec<u8>), RuntimeError>>);

impl DrainTask {
    async fn finish(mut self, deadline: Instant) -> Result<(Vec<u8>, Vec<u8>), DrainError> {
        match tokio::time::timeout_at(deadline, &mut self.0).await {
            Err(_) => Err(DrainError::TimedOut),
            Ok(Err(join_err)) => Err(DrainError::Failed(join_err.to_string())),
            Ok(Ok(Err(e))) => Err(DrainError::Failed(e.to_string())),
            Ok(Ok(Ok(output))) => Ok(output),
        }
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Owns one registered container until it has been torn down.
struct InstanceGuard {
    instance_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<InstanceRegistry>,
    teardown_timeout: Duration,
    claimed: bool,
    armed: bool,
}

impl InstanceGuard {
    /// Destroy the instance, then unregister it. If the shutdown sweep
    /// claimed it first, the sweep owns the teardown.
    async fn release(mut self) {
        if !self.claimed {
            self.claimed = self.registry.claim(&self.instance_id);
        }
        if self.claimed {
            destroy_instance(
                self.runtime.as_ref(),
                &self.instance_id,
                self.teardown_timeout,
            )
            .await;
            self.registry.unregister(&self.instance_id);
        } else {
            tracing::debug!(
                instance_id = %self.instance_id,
                "Instance already claimed by shutdown sweep"
            );
        }
        self.armed = false;
    }

    /// Drop the registration of a container that was never created.
    fn forget(mut self) {
        self.armed = false;
        if self.registry.claim(&self.instance_id) {
            self.registry.unregister(&self.instance_id);
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Claimed here rather than in the spawned task: the sweep must see
        // a teardown in flight and wait for it.
        if !self.claimed && !self.registry.claim(&self.instance_id) {
            return;
        }
        let instance_id = std::mem::take(&mut self.instance_id);
        let runtime = Arc::clone(&self.runtime);
        let registry = Arc::clone(&self.registry);
        let timeout = self.teardown_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(instance_id = %instance_id, "Execution cancelled, tearing down");
                handle.spawn(async move {
                    destroy_instance(runtime.as_ref(), &instance_id, timeout).await;
                    registry.unregister(&instance_id);
                });
            }
            Err(_) => {
                registry.unclaim(&instance_id);
                tracing::warn!(
                    instance_id = %instance_id,
                    "No async runtime to tear down instance; leaving it for the shutdown sweep"
                );
            }
        }
    }
}
