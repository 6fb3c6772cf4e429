use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::models::{
    ContainerInspectResponse, ContainerState, ContainerStateStatusEnum, HealthStatusEnum,
    HostConfig,
};
use bollard::volume::CreateVolumeOptions;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{
    classify, classify_lookup, BackendKind, CreateRequest, DockerClient, ExecOutput, ImageInfo,
    ObjectState, PublishedPort, Readiness, RuntimeBackend, RuntimeObject, StagingRequest,
};
use crate::error::{Result, SpawnError};
use crate::hub::CredentialFile;

/// Mount point of the certs volume inside the staging helper.
const STAGING_DIR: &str = "/staging";

/// Single-host backend: one engine container per sandbox.
pub struct ContainerBackend {
    client: Arc<DockerClient>,
    stop_timeout: i64,
}

impl ContainerBackend {
    pub fn new(client: Arc<DockerClient>) -> Self {
        Self {
            client,
            stop_timeout: 10,
        }
    }

    async fn remove_quietly(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.client.docker().remove_container(id, Some(options)).await {
            debug!("Ignoring failure to remove helper container {}: {}", id, e);
        }
    }
}

fn object_state(state: Option<ContainerState>) -> ObjectState {
    let Some(state) = state else {
        return ObjectState::Created;
    };
    let unhealthy = matches!(
        state.health.as_ref().and_then(|health| health.status.as_ref()),
        Some(HealthStatusEnum::UNHEALTHY)
    );
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) if unhealthy => ObjectState::Unhealthy,
        Some(ContainerStateStatusEnum::RUNNING) => ObjectState::Running,
        Some(ContainerStateStatusEnum::RESTARTING) => ObjectState::Starting,
        Some(ContainerStateStatusEnum::REMOVING) => ObjectState::Removing,
        Some(ContainerStateStatusEnum::CREATED)
        | Some(ContainerStateStatusEnum::EMPTY)
        | None => ObjectState::Created,
        _ => ObjectState::Exited {
            exit_code: state.exit_code,
            error: state.error.filter(|error| !error.is_empty()),
            finished_at: state.finished_at,
        },
    }
}

fn runtime_object(inspected: ContainerInspectResponse) -> RuntimeObject {
    let config = inspected.config.unwrap_or_default();
    let env = config
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();

    let settings = inspected.network_settings.unwrap_or_default();
    let networks = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, endpoint)| endpoint.ip_address.map(|ip| (name, ip)))
        .collect();

    let mut published_ports = Vec::new();
    for (key, bindings) in settings.ports.unwrap_or_default() {
        let Some(target) = key.split('/').next().and_then(|port| port.parse().ok()) else {
            continue;
        };
        for binding in bindings.unwrap_or_default() {
            let Some(host_port) = binding.host_port.and_then(|port| port.parse().ok()) else {
                continue;
            };
            published_ports.push(PublishedPort {
                target,
                host_ip: binding.host_ip,
                host_port,
            });
        }
    }
    published_ports.sort_by(|a, b| (a.target, a.host_port).cmp(&(b.target, b.host_port)));

    RuntimeObject {
        id: inspected.id.unwrap_or_default(),
        name: inspected
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image,
        state: object_state(inspected.state),
        env,
        networks,
        published_ports,
    }
}

fn credentials_archive(files: &[CredentialFile]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, &file.file_name, file.contents.as_slice())?;
    }
    builder.into_inner()
}

fn string_map(labels: &BTreeMap<String, String>) -> HashMap<String, String> {
    labels
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl RuntimeBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn get_object(&self, name_or_id: &str) -> Result<Option<RuntimeObject>> {
        let _permit = self.client.permit().await?;
        let subject = format!("container {name_or_id}");
        match self
            .client
            .docker()
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspected) => Ok(Some(runtime_object(inspected))),
            Err(e) => match classify_lookup(e, &subject) {
                SpawnError::NotFound(_) => {
                    debug!("Container {} is gone", name_or_id);
                    Ok(None)
                }
                err @ SpawnError::UnhealthyNode(_) => {
                    warn!("Container {} unreachable, treating as gone: {}", name_or_id, err);
                    Ok(None)
                }
                err => Err(err),
            },
        }
    }

    async fn poll(&self, object: &RuntimeObject) -> Result<Readiness> {
        Ok(match &object.state {
            ObjectState::Running | ObjectState::Unhealthy => Readiness::Ready,
            ObjectState::Creating | ObjectState::Created | ObjectState::Starting => {
                Readiness::Pending(format!("{:?}", object.state))
            }
            ObjectState::Removing => Readiness::Failed("container is being removed".to_string()),
            ObjectState::Exited {
                exit_code,
                error,
                finished_at,
            } => Readiness::Failed(format!(
                "ExitCode={}, Error='{}', FinishedAt={}",
                exit_code.map(|code| code.to_string()).unwrap_or_default(),
                error.as_deref().unwrap_or_default(),
                finished_at.as_deref().unwrap_or_default()
            )),
        })
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        self.client.inspect_image(image).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.client.pull_image(image).await
    }

    async fn create(&self, request: CreateRequest) -> Result<String> {
        let config: Config<String> = serde_json::from_value(request.body).map_err(|e| {
            SpawnError::Config(format!("invalid container request for {}: {e}", request.name))
        })?;
        let options = CreateContainerOptions {
            name: request.name.as_str(),
            platform: None,
        };

        let _permit = self.client.permit().await?;
        let response = self
            .client
            .docker()
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify(e, &format!("container {}", request.name)))?;
        for warning in &response.warnings {
            warn!("Creating container {}: {}", request.name, warning);
        }

        info!("Created container {} with ID: {}", request.name, response.id);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let _permit = self.client.permit().await?;
        match self
            .client
            .docker()
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!("Started container: {}", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already running", id);
                Ok(())
            }
            Err(e) => Err(classify(e, &format!("container {id}"))),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let _permit = self.client.permit().await?;
        let options = StopContainerOptions {
            t: self.stop_timeout,
        };
        match self.client.docker().stop_container(id, Some(options)).await {
            Ok(()) => {
                info!("Stopped container: {}", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!("Container {} already gone", id);
                Ok(())
            }
            Err(e) => Err(classify(e, &format!("container {id}"))),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _permit = self.client.permit().await?;
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };
        match self.client.docker().remove_container(id, Some(options)).await {
            Ok(()) => {
                info!("Removed container: {}", id);
                Ok(())
            }
            Err(e) => match classify(e, &format!("container {id}")) {
                SpawnError::NotFound(_) => {
                    warn!("Container {} already removed", id);
                    Ok(())
                }
                SpawnError::Conflict(message) => {
                    warn!("Container {} already being removed: {}", id, message);
                    Ok(())
                }
                err => Err(err),
            },
        }
    }

    async fn exec(&self, id: &str, argv: Vec<String>) -> Result<ExecOutput> {
        self.client.exec(id, argv).await
    }

    async fn stage_files(&self, request: StagingRequest) -> Result<()> {
        let archive = credentials_archive(&request.files).map_err(|e| {
            SpawnError::Config(format!("failed to pack credential files: {e}"))
        })?;
        let labels = string_map(&request.labels);
        let helper_name = format!("{}-staging", request.volume);

        let _permit = self.client.permit().await?;
        let docker = self.client.docker();
        let volume_options = CreateVolumeOptions {
            name: request.volume.clone(),
            labels: labels.clone(),
            ..Default::default()
        };
        docker
            .create_volume(volume_options)
            .await
            .map_err(|e| classify(e, &format!("volume {}", request.volume)))?;

        // A helper left behind by an interrupted attempt would block the name.
        self.remove_quietly(&helper_name).await;

        let helper = Config {
            image: Some(request.image.clone()),
            cmd: Some(vec!["true".to_string()]),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{STAGING_DIR}", request.volume)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: helper_name.as_str(),
                    platform: None,
                }),
                helper,
            )
            .await
            .map_err(|e| classify(e, &format!("container {helper_name}")))?;

        let uploaded = docker
            .upload_to_container(
                &created.id,
                Some(UploadToContainerOptions {
                    path: STAGING_DIR.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| classify(e, &format!("volume {}", request.volume)));
        self.remove_quietly(&created.id).await;
        uploaded?;

        info!(
            "Staged {} credential file(s) into volume {}",
            request.files.len(),
            request.volume
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings, PortBinding};

    use super::*;

    #[test]
    fn maps_inspect_response() {
        let inspected = ContainerInspectResponse {
            id: Some("c0ffee".into()),
            name: Some("/jupyter-bob".into()),
            config: Some(ContainerConfig {
                image: Some("busybox:1.36".into()),
                env: Some(vec!["JUPYTERHUB_API_TOKEN=abc=def".into(), "PATH=/bin".into()]),
                ..Default::default()
            }),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(HashMap::from([(
                    "bridge".to_string(),
                    EndpointSettings {
                        ip_address: Some("172.17.0.2".into()),
                        ..Default::default()
                    },
                )])),
                ports: Some(HashMap::from([(
                    "8888/tcp".to_string(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".into()),
                        host_port: Some("32768".into()),
                    }]),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let object = runtime_object(inspected);
        assert_eq!(object.id, "c0ffee");
        assert_eq!(object.name, "jupyter-bob");
        assert_eq!(object.image.as_deref(), Some("busybox:1.36"));
        assert_eq!(object.state, ObjectState::Running);
        assert_eq!(object.env["JUPYTERHUB_API_TOKEN"], "abc=def");
        assert_eq!(object.networks["bridge"], "172.17.0.2");
        assert_eq!(
            object.published_ports,
            vec![PublishedPort {
                target: 8888,
                host_ip: Some("0.0.0.0".into()),
                host_port: 32768
            }]
        );
    }

    #[test]
    fn exited_state_keeps_diagnostics() {
        let state = object_state(Some(ContainerState {
            status: Some(ContainerStateStatusEnum::EXITED),
            exit_code: Some(137),
            error: Some(String::new()),
            finished_at: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        }));
        assert_eq!(
            state,
            ObjectState::Exited {
                exit_code: Some(137),
                error: None,
                finished_at: Some("2024-01-01T00:00:00Z".into())
            }
        );
        assert_eq!(object_state(None), ObjectState::Created);
    }

    #[test]
    fn archive_contains_every_file() {
        let files = vec![
            CredentialFile {
                file_name: "server.crt".into(),
                contents: b"CERT".to_vec(),
                env_var: None,
            },
            CredentialFile {
                file_name: "server.key".into(),
                contents: b"KEY".to_vec(),
                env_var: None,
            },
        ];
        let archive = credentials_archive(&files).unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["server.crt", "server.key"]);
    }
}
