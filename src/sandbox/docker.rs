//! Container runtime seam and its Docker implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, DownloadFromContainerOptionsBuilder,
    KillContainerOptions, LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    UploadToContainerOptionsBuilder, WaitContainerOptions,
};
use bytes::Bytes;
use futures::StreamExt;
use tumbler_common::SandboxPhase;

use super::config::SandboxConfig;
use crate::errors::SandboxError;

/// Directory the project is copied into inside every container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Everything needed to create one phase container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub phase: SandboxPhase,
    /// `sh -c` script running the phase's commands in order.
    pub script: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub tmpfs_size: String,
    pub network: bool,
}

impl ContainerSpec {
    pub fn for_phase(
        config: &SandboxConfig,
        image: &str,
        phase: SandboxPhase,
        commands: &[String],
    ) -> Self {
        Self {
            image: image.to_string(),
            phase,
            script: phase_script(commands),
            memory_bytes: config.memory_bytes(),
            nano_cpus: config.nano_cpus(),
            pids_limit: config.pids_limit,
            tmpfs_size: config.tmpfs_size(),
            network: config.network_for(phase),
        }
    }

    pub fn network_mode(&self) -> &'static str {
        if self.network { "bridge" } else { "none" }
    }

    fn host_config(&self) -> HostConfig {
        let tmpfs: HashMap<String, String> = [
            ("/tmp".to_string(), format!("size={}", self.tmpfs_size)),
            ("/root".to_string(), "size=64m".to_string()),
        ]
        .into_iter()
        .collect();

        HostConfig {
            memory: Some(self.memory_bytes),
            nano_cpus: Some(self.nano_cpus),
            pids_limit: Some(self.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(tmpfs),
            network_mode: Some(self.network_mode().to_string()),
            auto_remove: Some(false),
            ..Default::default()
        }
    }
}

/// Shell script for a phase: stop on the first failing command, announcing
/// each one so the logs show where it stopped.
pub fn phase_script(commands: &[String]) -> String {
    let mut lines = vec![
        "#!/bin/sh".to_string(),
        "set -e".to_string(),
        format!("cd {}", CONTAINER_WORKSPACE),
    ];
    for command in commands {
        lines.push(format!("echo '=== RUNNING: {} ==='", command.replace('\'', "")));
        lines.push(command.clone());
    }
    lines.join("\n")
}

/// Operations the sandbox executor needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Create (but do not start) a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    /// Copy a tar archive into `path` inside a created container.
    async fn upload(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<(), SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// `(stdout, stderr)` of a finished container.
    async fn logs(&self, id: &str) -> Result<(String, String), SandboxError>;

    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    /// Tar of `path` inside the container.
    async fn download(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Force-remove the container.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}

/// Docker engine reached through `DOCKER_HOST` or the local socket.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect and ping. Fails with `Unavailable` when no engine answers.
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        tracing::info!("Connected to Docker engine");
        Ok(Self { docker })
    }

    fn container_err(phase: Option<SandboxPhase>, err: impl std::fmt::Display) -> SandboxError {
        match phase {
            Some(phase) => SandboxError::Container {
                phase,
                reason: err.to_string(),
            },
            None => SandboxError::Other(anyhow::anyhow!("{}", err)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image = %image, "Pulling sandbox image");
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let labels: HashMap<String, String> = [
            ("tumbler.role".to_string(), "sandbox".to_string()),
            ("tumbler.phase".to_string(), spec.phase.to_string()),
        ]
        .into_iter()
        .collect();

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                spec.script.clone(),
            ]),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            labels: Some(labels),
            host_config: Some(spec.host_config()),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default().build();

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| Self::container_err(Some(spec.phase), e))?;
        Ok(response.id)
    }

    async fn upload(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<(), SandboxError> {
        let options = UploadToContainerOptionsBuilder::default().path(path).build();
        self.docker
            .upload_to_container(id, Some(options), bollard::body_full(Bytes::from(archive)))
            .await
            .map_err(|e| Self::container_err(None, e))
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| Self::container_err(None, e))
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        let mut exit_code = -1;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                // Non-zero exits arrive as an error carrying the code.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code
                }
                Err(e) => return Err(Self::container_err(None, e)),
            }
        }
        Ok(exit_code)
    }

    async fn logs(&self, id: &str) -> Result<(String, String), SandboxError> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| Self::container_err(None, e))? {
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
            .map_err(|e| Self::container_err(None, e))
    }

    async fn download(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let options = DownloadFromContainerOptionsBuilder::default()
            .path(path)
            .build();
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(|e| Self::container_err(None, e))?);
        }
        Ok(archive)
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Self::container_err(None, e))
    }
}
