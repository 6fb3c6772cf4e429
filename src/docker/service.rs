use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, Service, ServiceServiceStatus, ServiceSpec};
use bollard::service::{InspectServiceOptions, ListServicesOptions};
use tracing::{debug, info, warn};

use super::{
    classify, classify_lookup, BackendKind, CreateRequest, DockerClient, ExecOutput, ImageInfo,
    ObjectState, PublishedPort, Readiness, RuntimeBackend, RuntimeObject, StagingRequest,
};
use crate::error::{Result, SpawnError};

/// Label the swarm puts on every task container.
const SERVICE_NAME_LABEL: &str = "com.docker.swarm.service.name";

/// Task container states that may still turn into a running task.
const TRANSIENT_CONTAINER_STATES: &[&str] = &["created", "restarting", "running", "paused"];

/// Clustered backend: one swarm service per sandbox.
///
/// Services are declarative. There is nothing to start or stop; the
/// scheduler runs a task once the service exists, and removal is the only
/// way to make it go away.
pub struct ServiceBackend {
    client: Arc<DockerClient>,
}

impl ServiceBackend {
    pub fn new(client: Arc<DockerClient>) -> Self {
        Self { client }
    }

    /// Task counts for the service. `None` when the service is gone.
    async fn task_counts(&self, service_name: &str) -> Result<Option<ServiceServiceStatus>> {
        let _permit = self.client.permit().await?;
        let filters = HashMap::from([("name", vec![service_name])]);
        let services = self
            .client
            .docker()
            .list_services(Some(ListServicesOptions {
                filters,
                status: true,
            }))
            .await
            .map_err(|e| classify(e, &format!("service {service_name}")))?;

        // The name filter matches prefixes.
        Ok(services
            .into_iter()
            .find(|service| {
                service.spec.as_ref().and_then(|spec| spec.name.as_deref()) == Some(service_name)
            })
            .map(|service| service.service_status.unwrap_or_default()))
    }

    /// Task containers of the service visible to this daemon, newest first.
    async fn task_containers(&self, service_name: &str) -> Result<Vec<ContainerSummary>> {
        let _permit = self.client.permit().await?;
        let label = format!("{SERVICE_NAME_LABEL}={service_name}");
        let filters = HashMap::from([("label", vec![label.as_str()])]);
        let mut containers = self
            .client
            .docker()
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify(e, &format!("tasks of service {service_name}")))?;
        containers.sort_by_key(|container| std::cmp::Reverse(container.created.unwrap_or_default()));
        Ok(containers)
    }
}

/// Readiness of a single-replica service.
///
/// Only a task in the `running` state counts. Task containers are consulted
/// for a diagnostic while none runs; a newest task that already stopped is
/// terminal.
fn task_readiness(
    service_name: &str,
    counts: &ServiceServiceStatus,
    task_containers: &[ContainerSummary],
) -> Result<Readiness> {
    let running = counts.running_tasks.unwrap_or_default();
    if running > 1 {
        return Err(SpawnError::Unexpected(format!(
            "found {running} running tasks for service '{service_name}'"
        )));
    }
    if running == 1 {
        return Ok(Readiness::Ready);
    }

    let desired = counts.desired_tasks.unwrap_or_default();
    let Some(newest) = task_containers.first() else {
        return Ok(Readiness::Pending(format!(
            "no running task (0 of {desired} running)"
        )));
    };
    let state = newest.state.as_deref().unwrap_or_default();
    let diagnostic = format!(
        "state={state}, status={}",
        newest.status.as_deref().unwrap_or_default()
    );
    if state.is_empty() || TRANSIENT_CONTAINER_STATES.contains(&state) {
        Ok(Readiness::Pending(diagnostic))
    } else {
        Ok(Readiness::Failed(diagnostic))
    }
}

fn runtime_object(service: Service) -> RuntimeObject {
    let spec = service.spec.unwrap_or_default();
    let container = spec
        .task_template
        .and_then(|task| task.container_spec)
        .unwrap_or_default();
    let env: BTreeMap<String, String> = container
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();
    let published_ports = service
        .endpoint
        .and_then(|endpoint| endpoint.ports)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| {
            Some(PublishedPort {
                target: u16::try_from(port.target_port?).ok()?,
                host_ip: None,
                host_port: u16::try_from(port.published_port?).ok()?,
            })
        })
        .collect();

    RuntimeObject {
        id: service.id.unwrap_or_default(),
        name: spec.name.unwrap_or_default(),
        image: container.image,
        // Desired state; task state is what `poll` reports.
        state: ObjectState::Running,
        env,
        networks: BTreeMap::new(),
        published_ports,
    }
}

#[async_trait]
impl RuntimeBackend for ServiceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Service
    }

    async fn get_object(&self, name_or_id: &str) -> Result<Option<RuntimeObject>> {
        let _permit = self.client.permit().await?;
        match self
            .client
            .docker()
            .inspect_service(name_or_id, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => Ok(Some(runtime_object(service))),
            Err(e) => match classify_lookup(e, &format!("service {name_or_id}")) {
                SpawnError::NotFound(_) => {
                    debug!("Service {} is gone", name_or_id);
                    Ok(None)
                }
                err @ SpawnError::UnhealthyNode(_) => {
                    warn!("Service {} unreachable, treating as gone: {}", name_or_id, err);
                    Ok(None)
                }
                err => Err(err),
            },
        }
    }

    async fn poll(&self, object: &RuntimeObject) -> Result<Readiness> {
        let Some(counts) = self.task_counts(&object.name).await? else {
            info!("Service '{}' is gone", object.name);
            return Ok(Readiness::Failed(format!("service {} no longer exists", object.name)));
        };
        let task_containers = if counts.running_tasks.unwrap_or_default() == 1 {
            Vec::new()
        } else {
            self.task_containers(&object.name).await?
        };
        let readiness = task_readiness(&object.name, &counts, &task_containers)?;
        debug!("Service {} readiness: {:?}", object.name, readiness);
        Ok(readiness)
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo> {
        self.client.inspect_image(image).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.client.pull_image(image).await
    }

    async fn create(&self, request: CreateRequest) -> Result<String> {
        let spec: ServiceSpec = serde_json::from_value(request.body).map_err(|e| {
            SpawnError::Config(format!("invalid service request for {}: {e}", request.name))
        })?;

        let _permit = self.client.permit().await?;
        let response = self
            .client
            .docker()
            .create_service(spec, None)
            .await
            .map_err(|e| classify(e, &format!("service {}", request.name)))?;
        let id = response.id.ok_or_else(|| {
            SpawnError::Unexpected(format!("no id returned for service {}", request.name))
        })?;

        info!("Created service {} with ID: {}", request.name, id);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        debug!("Service {} is scheduled by the swarm, nothing to start", id);
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        debug!("Service {} has no stop action", id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _permit = self.client.permit().await?;
        match self.client.docker().delete_service(id).await {
            Ok(()) => {
                info!("Removed service: {}", id);
                Ok(())
            }
            Err(e) => match classify(e, &format!("service {id}")) {
                SpawnError::NotFound(_) => {
                    warn!("Service {} already removed", id);
                    Ok(())
                }
                SpawnError::Conflict(message) => {
                    warn!("Service {} already being removed: {}", id, message);
                    Ok(())
                }
                err => Err(err),
            },
        }
    }

    async fn exec(&self, id: &str, _argv: Vec<String>) -> Result<ExecOutput> {
        Err(SpawnError::Config(format!(
            "cannot exec into service {id}; commands run inside containers only"
        )))
    }

    async fn stage_files(&self, request: StagingRequest) -> Result<()> {
        Err(SpawnError::Config(format!(
            "cannot stage credentials into volume {} for a service; internal TLS needs the container backend",
            request.volume
        )))
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::{EndpointPortConfig, ServiceEndpoint, TaskSpec, TaskSpecContainerSpec};
    use rstest::rstest;

    use super::*;

    fn counts(running: u64) -> ServiceServiceStatus {
        ServiceServiceStatus {
            running_tasks: Some(running),
            desired_tasks: Some(1),
            completed_tasks: None,
        }
    }

    fn task_container(state: &str, status: &str, created: i64) -> ContainerSummary {
        ContainerSummary {
            state: Some(state.into()),
            status: Some(status.into()),
            created: Some(created),
            ..Default::default()
        }
    }

    #[test]
    fn one_running_task_is_ready() {
        let readiness = task_readiness("jupyter-bob", &counts(1), &[]).unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[test]
    fn several_running_tasks_are_unexpected() {
        let err = task_readiness("jupyter-bob", &counts(2), &[]).unwrap_err();
        assert!(matches!(err, SpawnError::Unexpected(ref msg) if msg.contains("2 running tasks")));
    }

    #[test]
    fn unscheduled_service_is_pending() {
        let readiness = task_readiness("jupyter-bob", &counts(0), &[]).unwrap();
        assert!(matches!(readiness, Readiness::Pending(ref msg) if msg.contains("0 of 1")));
    }

    #[rstest]
    #[case("created", false)]
    #[case("running", false)]
    #[case("restarting", false)]
    #[case("exited", true)]
    #[case("dead", true)]
    #[case("removing", true)]
    fn task_container_states(#[case] state: &str, #[case] failed: bool) {
        let containers = [task_container(state, "Exited (1) 2 seconds ago", 10)];
        let readiness = task_readiness("jupyter-bob", &counts(0), &containers).unwrap();
        assert_eq!(matches!(readiness, Readiness::Failed(_)), failed);
        assert!(!matches!(readiness, Readiness::Ready));
    }

    #[test]
    fn newest_task_decides() {
        let mut containers = vec![
            task_container("exited", "Exited (137) 1 minute ago", 10),
            task_container("created", "Created", 20),
        ];
        containers.sort_by_key(|c| std::cmp::Reverse(c.created.unwrap_or_default()));
        let readiness = task_readiness("jupyter-bob", &counts(0), &containers).unwrap();
        assert!(matches!(readiness, Readiness::Pending(ref msg) if msg.contains("state=created")));
    }

    #[test]
    fn failure_carries_the_container_status() {
        let containers = [task_container("exited", "Exited (1) 3 seconds ago", 10)];
        let readiness = task_readiness("jupyter-bob", &counts(0), &containers).unwrap();
        assert!(matches!(readiness, Readiness::Failed(ref msg) if msg.contains("Exited (1)")));
    }

    #[test]
    fn maps_service_to_object() {
        let service = Service {
            id: Some("svc1".into()),
            spec: Some(ServiceSpec {
                name: Some("jupyter-bob".into()),
                task_template: Some(TaskSpec {
                    container_spec: Some(TaskSpecContainerSpec {
                        image: Some("busybox".into()),
                        env: Some(vec!["JPY_API_TOKEN=tok".into()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            endpoint: Some(ServiceEndpoint {
                ports: Some(vec![EndpointPortConfig {
                    target_port: Some(8888),
                    published_port: Some(30001),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let object = runtime_object(service);
        assert_eq!(object.id, "svc1");
        assert_eq!(object.name, "jupyter-bob");
        assert_eq!(object.env["JPY_API_TOKEN"], "tok");
        assert_eq!(
            object.published_ports,
            vec![PublishedPort {
                target: 8888,
                host_ip: None,
                host_port: 30001
            }]
        );
    }
}
