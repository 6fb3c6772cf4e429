use anyhow::Context;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::container::LogOutput;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::StreamExt;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use super::{ExecOutput, ImageInfo};
use crate::config::DockerConfig;
use crate::error::{Result, SpawnError};

/// Maps a daemon error onto the error taxonomy.
pub fn classify(err: bollard::errors::Error, subject: &str) -> SpawnError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => SpawnError::NotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => SpawnError::Conflict(format!("{subject}: {message}")),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => SpawnError::Runtime {
            status: status_code,
            message,
        },
        other => SpawnError::Transport(other.to_string()),
    }
}

/// Like [`classify`], but for object lookups a 500 means the node that
/// hosts the object is gone.
pub fn classify_lookup(err: bollard::errors::Error, subject: &str) -> SpawnError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message,
        } => SpawnError::UnhealthyNode(format!("{subject}: {message}")),
        other => classify(other, subject),
    }
}

/// Splits `repo[:tag]`, leaving registry ports and digests intact.
/// Untagged references resolve to `latest`.
pub fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Process-wide handle on the Docker daemon.
///
/// Built once at startup and shared by every backend. All daemon calls go
/// through [`DockerClient::permit`], which bounds how many are in flight.
pub struct DockerClient {
    docker: Docker,
    permits: Semaphore,
}

impl DockerClient {
    pub async fn connect(config: &DockerConfig) -> anyhow::Result<Self> {
        let docker = if let Some(socket) = &config.socket_path {
            Docker::connect_with_socket(socket, config.timeout_secs, &API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_socket_defaults()?
        };

        let version = docker
            .version()
            .await
            .context("Failed to connect to Docker daemon")?;
        info!(
            "Connected to Docker daemon version: {}",
            version.version.unwrap_or_default()
        );

        Ok(Self::with_docker(docker, config.max_concurrent_requests))
    }

    pub fn with_docker(docker: Docker, max_concurrent_requests: usize) -> Self {
        Self {
            docker,
            permits: Semaphore::new(max_concurrent_requests.max(1)),
        }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| SpawnError::Transport("docker client is shut down".to_string()))
    }

    pub async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        let _permit = self.permit().await?;
        let inspected = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| classify(e, &format!("image {image}")))?;
        Ok(ImageInfo {
            id: inspected.id.unwrap_or_default(),
            cmd: inspected.config.and_then(|config| config.cmd),
        })
    }

    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let _permit = self.permit().await?;
        let (repo, tag) = split_image_reference(image);
        info!("Pulling image {}:{}", repo, tag);

        let options = CreateImageOptions {
            from_image: repo,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| classify(e, &format!("image {image}")))?;
            if let Some(status) = progress.status {
                debug!("Pull {}: {}", image, status);
            }
        }

        info!("Finished pulling image {}", image);
        Ok(())
    }

    pub async fn exec(&self, id: &str, argv: Vec<String>) -> Result<ExecOutput> {
        let _permit = self.permit().await?;
        let subject = format!("container {id}");
        let options = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| classify(e, &subject))?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, &subject))?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdErr { message }) => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(other) => output.stdout.push_str(&other.to_string()),
                    Err(e) => warn!("Error reading exec output from {}: {}", id, e),
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(e, &subject))?;
        output.exit_code = inspected.exit_code;
        Ok(output)
    }
}
