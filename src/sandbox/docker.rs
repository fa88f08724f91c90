//! [`ContainerRuntime`] backed by the Docker Engine API via bollard.

use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::error::RuntimeError;
use crate::sandbox::payload::PAYLOAD_DIR;
use crate::sandbox::runtime::{ContainerRuntime, InstanceSpec, OutputChunk, OutputStream};

/// CFS scheduling period the quota is measured against.
const CPU_PERIOD_US: i64 = 100_000;

/// Connect to the local Docker daemon and verify it answers.
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| RuntimeError::Unavailable(format!("failed to create docker client: {e}")))?;
    docker
        .ping()
        .await
        .map_err(|e| RuntimeError::Unavailable(format!("docker daemon not reachable: {e}")))?;
    Ok(docker)
}

/// Docker runtime with a lazily created, shared connection.
///
/// Connecting is deferred to the first request so the service can start
/// (and answer `/ping`) while the daemon is still coming up; requests made
/// while it is unreachable fail with [`RuntimeError::Unavailable`].
#[derive(Clone, Default)]
pub struct DockerRuntime {
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing connection.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker: Arc::new(RwLock::new(Some(docker))),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = connect_docker().await?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }
}

fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("docker returned {status_code}: {message}")),
        e @ (BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::RequestTimeoutError) => RuntimeError::Unavailable(e.to_string()),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// 409 from kill/remove means "not running" or "removal in progress":
/// the instance is already on its way out.
fn is_conflict(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;

        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(classify)?;
        }
        tracing::info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let docker = self.docker().await?;

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            // Same as memory: no swap on top of the cap.
            memory_swap: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(CPU_PERIOD_US),
            pids_limit: Some(spec.pids_limit),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(PAYLOAD_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(classify)?;

        for warning in &response.warnings {
            tracing::debug!(instance_id = %response.id, warning = %warning, "Docker create warning");
        }

        Ok(response.id)
    }

    async fn upload_archive(
        &self,
        instance_id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        docker
            .upload_to_container(instance_id, Some(options), archive.into())
            .await
            .map_err(classify)
    }

    async fn attach_output(&self, instance_id: &str) -> Result<OutputStream, RuntimeError> {
        let docker = self.docker().await?;
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } = docker
            .attach_container(instance_id, Some(options))
            .await
            .map_err(classify)?;

        let chunks = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(classify(e))),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn start(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .start_container(instance_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn wait_terminal(&self, instance_id: &str) -> Result<i64, RuntimeError> {
        let docker = self.docker().await?;
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = docker.wait_container(instance_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit status as an error.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(e)),
            None => Err(RuntimeError::Api(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn inspect_exit_code(&self, instance_id: &str) -> Result<i64, RuntimeError> {
        let docker = self.docker().await?;
        let info = docker
            .inspect_container(instance_id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        info.state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| RuntimeError::Api("container state has no exit code".to_string()))
    }

    async fn kill(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        match docker
            .kill_container(instance_id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match docker.remove_container(instance_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}
