//! Docker sandbox driver implementation.
//!
//! Runs each tool call in a throwaway container with no network access,
//! declared CPU/memory caps, and a hard wall-clock timeout. Containers are
//! force-removed on every exit path.

use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{RunOutput, RunSpec, SandboxDriver, SandboxError, SandboxResult};

/// CPU scheduler period used to translate `cpu_percent` into a quota.
const CPU_PERIOD_MICROS: i64 = 100_000;

/// Sandbox driver backed by the local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connects to the local Docker daemon.
    pub fn new() -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Setup(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn remove_quietly(&self, container_id: &str) {
        let result = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(container_id, error = %e, "failed to remove tool container");
        }
    }

    async fn collect_logs(&self, container_id: &str) -> (Vec<u8>, String) {
        let mut stdout = Vec::new();
        let mut stderr = String::new();
        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(entry) = logs.next().await {
            match entry {
                Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id, error = %e, "failed to read tool container logs");
                    break;
                }
            }
        }
        (stdout, stderr)
    }

    /// Waits for the container to exit and resolves its status code.
    async fn wait_for_exit(&self, container_id: &str) -> SandboxResult<i64> {
        let mut wait = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as a typed error from the wait API.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Execution(e.to_string())),
            None => Err(SandboxError::Execution(
                "container wait stream ended without a status".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl SandboxDriver for DockerDriver {
    async fn validate_image(&self, image: &str) -> SandboxResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "image not present locally, pulling");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| {
                SandboxError::Setup(format!("failed to pull image {image}: {e}"))
            })?;
        }

        self.docker
            .inspect_image(image)
            .await
            .map_err(|e| SandboxError::Setup(format!("image {image} is not usable: {e}")))?;
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, spec: RunSpec) -> SandboxResult<RunOutput> {
        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", m.host_path.display(), m.container_path, mode)
            })
            .collect();

        let mut host_config = bollard::models::HostConfig {
            binds: Some(binds),
            network_mode: Some("none".to_string()),
            ..Default::default()
        };
        if let Some(memory_mb) = spec.memory_limit_mb {
            host_config.memory = Some((memory_mb * 1024 * 1024) as i64);
        }
        if let Some(cpu_percent) = spec.cpu_percent {
            host_config.cpu_period = Some(CPU_PERIOD_MICROS);
            host_config.cpu_quota = Some(CPU_PERIOD_MICROS * cpu_percent as i64 / 100);
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("mindtrial-tool-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container_id = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?
            .id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_quietly(&container_id).await;
            return Err(SandboxError::Execution(e.to_string()));
        }

        let exit_code = tokio::select! {
            waited = tokio::time::timeout(spec.timeout, self.wait_for_exit(&container_id)) => {
                match waited {
                    Ok(Ok(code)) => code,
                    Ok(Err(e)) => {
                        self.remove_quietly(&container_id).await;
                        return Err(e);
                    }
                    Err(_) => {
                        self.remove_quietly(&container_id).await;
                        return Err(SandboxError::Timeout(spec.timeout));
                    }
                }
            }
            _ = cancel.cancelled() => {
                self.remove_quietly(&container_id).await;
                return Err(SandboxError::Cancelled);
            }
        };

        let (stdout, stderr) = self.collect_logs(&container_id).await;
        self.remove_quietly(&container_id).await;

        Ok(RunOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn close(&self) -> SandboxResult<()> {
        Ok(())
    }
}
