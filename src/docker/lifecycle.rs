use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::endpoint::{resolve_endpoint, Endpoint, EndpointPolicy};
use super::spec::{SandboxSpec, SpecBuilder};
use super::system_user::{lookup_passwd, SystemUser};
use super::{
    BackendKind, ContainerBackend, DockerClient, ObjectState, Readiness, RuntimeBackend,
    RuntimeObject, ServiceBackend, StagingRequest,
};
use crate::config::{PullPolicy, SpawnerConfig};
use crate::error::{Result, SpawnError};
use crate::hub::{Hub, PersistedState};
use crate::naming::SandboxIdentity;

/// What the framework's health check sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxStatus {
    Ready,
    NotReady(String),
    Absent,
}

/// Capped exponential backoff for readiness polling.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    factor: f64,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            next: initial,
            factor,
            cap,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.cap);
        self.next = self.next.mul_f64(self.factor).min(self.cap);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.5, Duration::from_secs(11))
    }
}

/// Drives one sandbox at a time from whatever the runtime reports to the
/// desired state.
///
/// Nothing about object state is cached between calls: every operation
/// starts by asking the backend. Callers serialize calls per identity;
/// calls for different identities may run concurrently.
pub struct LifecycleController {
    config: Arc<SpawnerConfig>,
    backend: Arc<dyn RuntimeBackend>,
    hub: Arc<dyn Hub>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<SpawnerConfig>,
        backend: Arc<dyn RuntimeBackend>,
        hub: Arc<dyn Hub>,
    ) -> Self {
        Self {
            config,
            backend,
            hub,
        }
    }

    /// Picks the backend variant named by the configuration.
    pub fn with_client(
        config: Arc<SpawnerConfig>,
        client: Arc<DockerClient>,
        hub: Arc<dyn Hub>,
    ) -> Self {
        let backend: Arc<dyn RuntimeBackend> = match config.backend {
            BackendKind::Container => Arc::new(ContainerBackend::new(client)),
            BackendKind::Service => Arc::new(ServiceBackend::new(client)),
        };
        Self::new(config, backend, hub)
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    pub fn identity(&self, username: &str, session: &str) -> SandboxIdentity {
        self.config.naming().identity(username, session)
    }

    /// The persisted name wins over the template, so a template change
    /// does not orphan a live object.
    pub async fn object_name(&self, identity: &SandboxIdentity, image: &str) -> Result<String> {
        let state = self.hub.load_state(identity).await?;
        Ok(self.name_for(&state, identity, image))
    }

    fn name_for(&self, state: &PersistedState, identity: &SandboxIdentity, image: &str) -> String {
        match &state.object_name {
            Some(name) => name.clone(),
            None => self.config.naming().object_name(identity, image),
        }
    }

    /// Resolves configuration plus framework-provided environment into a spec.
    pub async fn resolve_spec(
        &self,
        identity: &SandboxIdentity,
        requested_image: Option<&str>,
    ) -> Result<SandboxSpec> {
        let mut spec = SandboxSpec::resolve(&self.config, identity, requested_image).await?;
        let overrides = self.hub.env_overrides(identity).await?;
        spec.environment.extend(overrides);
        if self.config.system_user.enabled {
            let state = self.hub.load_state(identity).await?;
            let ns = self.config.naming().namespace(identity, &spec.image);
            let user = SystemUser::resolve(&self.config.system_user, &ns, &state, lookup_passwd)?;
            user.apply(&mut spec, &self.config.system_user);
        }
        Ok(spec)
    }

    /// Resolves the sandbox spec for `requested_image` and makes sure the sandbox runs.
    pub async fn launch(
        &self,
        identity: &SandboxIdentity,
        requested_image: Option<&str>,
    ) -> Result<Endpoint> {
        let spec = self.resolve_spec(identity, requested_image).await?;
        self.ensure_running(identity, &spec).await
    }

    pub async fn ensure_running(
        &self,
        identity: &SandboxIdentity,
        spec: &SandboxSpec,
    ) -> Result<Endpoint> {
        match self.run(identity, spec).await {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                error!("Failed to start sandbox for {}: {}", identity.label(), e);
                Err(e)
            }
        }
    }

    async fn run(&self, identity: &SandboxIdentity, spec: &SandboxSpec) -> Result<Endpoint> {
        let kind = self.backend.kind().object_type();
        let state = self.hub.load_state(identity).await?;
        let name = self.name_for(&state, identity, &spec.image);

        let existing = match self.backend.get_object(&name).await? {
            Some(object) if self.should_replace(&object, spec) => {
                self.backend.remove(&object.id).await?;
                None
            }
            other => other,
        };

        let id = match existing {
            Some(object) => {
                info!("Found existing {} {} (id: {})", kind, name, short_id(&object.id));
                self.recover_token(identity, &object).await?;
                object.id
            }
            None => match self.create(identity, spec, &name).await? {
                Created::New(id) => id,
                Created::Adopted(object) => {
                    self.recover_token(identity, &object).await?;
                    object.id
                }
            },
        };
        let mut record = state.with_object(&id, &name);
        record.user_id = spec.user_id.or(state.user_id);
        record.group_id = spec.group_id.or(state.group_id);
        self.hub.save_state(identity, &record).await?;

        let timeout = self.config.start_timeout();
        let object = match tokio::time::timeout(timeout, self.start_and_wait(&id, &name)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SpawnError::Timeout {
                    subject: format!("{kind} {name}"),
                    timeout,
                })
            }
        };

        let endpoint = resolve_endpoint(&object, &EndpointPolicy::from_config(&self.config))?;
        info!("{} {} for {} is ready at {}", kind, name, identity.label(), endpoint);
        self.hub.report_endpoint(identity, &endpoint).await?;

        if let Some(argv) = &spec.post_start_cmd {
            self.post_start(&object, argv.clone()).await;
        }
        Ok(endpoint)
    }

    fn should_replace(&self, object: &RuntimeObject, spec: &SandboxSpec) -> bool {
        let kind = self.backend.kind().object_type();
        if self.config.removes_objects() {
            warn!(
                "Removing {} {} that should have been cleaned up (id: {})",
                kind,
                object.name,
                short_id(&object.id)
            );
            return true;
        }
        if object.state == ObjectState::Removing {
            warn!("{} {} is being removed, replacing it", kind, object.name);
            return true;
        }
        match object.image.as_deref() {
            Some(image) if image != spec.image && object.state.is_running() => {
                warn!(
                    "{} {} is running image {} but {} was requested; keeping the running object",
                    kind, object.name, image, spec.image
                );
                false
            }
            Some(image) if image != spec.image => {
                info!(
                    "{} {} has image {}, replacing it to run {}",
                    kind, object.name, image, spec.image
                );
                true
            }
            _ => false,
        }
    }

    async fn recover_token(&self, identity: &SandboxIdentity, object: &RuntimeObject) -> Result<()> {
        let token = self
            .config
            .token_env_keys
            .iter()
            .find_map(|key| object.env.get(key).filter(|token| !token.is_empty()));
        if let Some(token) = token {
            self.hub.restore_api_token(identity, token).await?;
        }
        Ok(())
    }

    async fn create(
        &self,
        identity: &SandboxIdentity,
        spec: &SandboxSpec,
        name: &str,
    ) -> Result<Created> {
        let policy = self.config.effective_pull_policy();
        self.ensure_image(&spec.image, policy).await?;

        let image_cmd = if spec.needs_image_command() {
            if policy == PullPolicy::Skip {
                return Err(SpawnError::Config(format!(
                    "args are set without cmd, but pull policy 'skip' forbids inspecting {} for its default command",
                    spec.image
                )));
            }
            self.backend.inspect_image(&spec.image).await?.cmd
        } else {
            None
        };
        let command = spec.command(image_cmd.as_deref());

        let mut spec = spec.clone();
        if let Some(volume) = spec.certs_volume.clone() {
            self.stage_certs(&mut spec, volume).await?;
        }
        let request = SpecBuilder::new(self.backend.kind(), &spec).build(name, command);

        // The runtime is the only arbiter of name uniqueness; re-check as
        // late as possible to keep the window small.
        if let Some(object) = self.settled_object(name).await? {
            warn!(
                "{} {} appeared while preparing to create it, adopting it",
                self.backend.kind().object_type(),
                name
            );
            return Ok(Created::Adopted(object));
        }

        let id = match self.backend.create(request).await {
            Ok(id) => id,
            Err(SpawnError::Conflict(message)) => match self.backend.get_object(name).await? {
                Some(object) if object.state != ObjectState::Removing => {
                    warn!(
                        "{} {} was created concurrently ({}), adopting it",
                        self.backend.kind().object_type(),
                        name,
                        message
                    );
                    return Ok(Created::Adopted(object));
                }
                _ => return Err(SpawnError::Conflict(message)),
            },
            Err(e) => return Err(e),
        };
        info!(
            "Created {} {} (id: {}) for {} from {}",
            self.backend.kind().object_type(),
            name,
            short_id(&id),
            identity.label(),
            spec.image
        );
        Ok(Created::New(id))
    }

    /// Looks `name` up, waiting out a removal that is still in progress.
    async fn settled_object(&self, name: &str) -> Result<Option<RuntimeObject>> {
        let timeout = self.config.start_timeout();
        match tokio::time::timeout(timeout, self.wait_unless_removing(name)).await {
            Ok(result) => result,
            Err(_) => Err(SpawnError::Timeout {
                subject: format!("removal of {} {}", self.backend.kind().object_type(), name),
                timeout,
            }),
        }
    }

    async fn wait_unless_removing(&self, name: &str) -> Result<Option<RuntimeObject>> {
        let mut backoff = Backoff::default();
        loop {
            match self.backend.get_object(name).await? {
                Some(object) if object.state == ObjectState::Removing => {
                    let delay = backoff.next_delay();
                    debug!(
                        "{} {} is still being removed, checking again in {:?}",
                        self.backend.kind().object_type(),
                        name,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return Ok(other),
            }
        }
    }

    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> Result<()> {
        match policy {
            PullPolicy::Skip => Ok(()),
            PullPolicy::Always => self.backend.pull_image(image).await,
            PullPolicy::IfNotPresent => match self.backend.inspect_image(image).await {
                Ok(_) => Ok(()),
                Err(SpawnError::NotFound(_)) => {
                    info!("Image {} not present, pulling", image);
                    self.backend.pull_image(image).await
                }
                Err(e) => Err(e),
            },
            PullPolicy::Never => self.backend.inspect_image(image).await.map(|_| ()),
        }
    }

    async fn stage_certs(&self, spec: &mut SandboxSpec, volume: String) -> Result<()> {
        let files = self
            .hub
            .read_credential_files(&self.config.internal_tls.files)
            .await?;
        for file in &files {
            if let Some(var) = &file.env_var {
                spec.environment.insert(
                    var.clone(),
                    format!("{}/{}", spec.certs_location.trim_end_matches('/'), file.file_name),
                );
            }
        }
        self.backend
            .stage_files(StagingRequest {
                volume,
                image: spec.image.clone(),
                files,
                labels: spec.labels.clone(),
            })
            .await
    }

    async fn start_and_wait(&self, id: &str, name: &str) -> Result<RuntimeObject> {
        let kind = self.backend.kind().object_type();
        self.backend.start(id).await?;

        let mut backoff = Backoff::default();
        loop {
            let Some(object) = self.backend.get_object(id).await? else {
                return Err(SpawnError::StartFailed {
                    subject: format!("{kind} {name}"),
                    reason: "object disappeared after start".to_string(),
                });
            };
            match self.backend.poll(&object).await? {
                Readiness::Ready => return Ok(object),
                Readiness::Failed(reason) => {
                    return Err(SpawnError::StartFailed {
                        subject: format!("{kind} {name}"),
                        reason,
                    })
                }
                Readiness::Pending(status) => {
                    let delay = backoff.next_delay();
                    debug!("{} {} not ready ({}), retrying in {:?}", kind, name, status, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn post_start(&self, object: &RuntimeObject, argv: Vec<String>) {
        debug!("Running post-start command in {}: {:?}", object.name, argv);
        match self.backend.exec(&object.id, argv).await {
            Ok(output) => {
                if !output.stdout.is_empty() {
                    debug!("post_start stdout: {}", output.stdout.trim_end());
                }
                if !output.stderr.is_empty() {
                    warn!("post_start stderr: {}", output.stderr.trim_end());
                }
                if let Some(code) = output.exit_code.filter(|code| *code != 0) {
                    warn!("post_start command in {} exited with {}", object.name, code);
                }
            }
            Err(e) => warn!("post_start command in {} failed: {}", object.name, e),
        }
    }

    pub async fn ensure_stopped(&self, identity: &SandboxIdentity) -> Result<()> {
        let kind = self.backend.kind().object_type();
        let state = self.hub.load_state(identity).await?;
        let name = self.name_for(&state, identity, &self.config.image);

        let Some(object) = self.backend.get_object(&name).await? else {
            info!("No {} {} to stop for {}", kind, name, identity.label());
            if state.has_object() {
                self.hub.save_state(identity, &state.without_object()).await?;
            }
            return Ok(());
        };

        if matches!(
            object.state,
            ObjectState::Running | ObjectState::Unhealthy | ObjectState::Starting
        ) {
            info!("Stopping {} {} (id: {})", kind, name, short_id(&object.id));
            self.backend.stop(&object.id).await?;
        }
        if self.config.removes_objects() {
            info!("Removing {} {} (id: {})", kind, name, short_id(&object.id));
            self.backend.remove(&object.id).await?;
        }

        self.hub.save_state(identity, &state.without_object()).await?;
        Ok(())
    }

    pub async fn poll_status(&self, identity: &SandboxIdentity) -> Result<SandboxStatus> {
        let state = self.hub.load_state(identity).await?;
        let name = self.name_for(&state, identity, &self.config.image);

        let Some(object) = self.backend.get_object(&name).await? else {
            if state.object_id.is_some() {
                warn!(
                    "{} {} for {} is gone, discarding its id",
                    self.backend.kind().object_type(),
                    name,
                    identity.label()
                );
                self.hub.save_state(identity, &state.without_object()).await?;
            }
            return Ok(SandboxStatus::Absent);
        };

        Ok(match self.backend.poll(&object).await? {
            Readiness::Ready => SandboxStatus::Ready,
            Readiness::Pending(status) | Readiness::Failed(status) => {
                SandboxStatus::NotReady(status)
            }
        })
    }
}

enum Created {
    New(String),
    Adopted(RuntimeObject),
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
