#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use dockspawn::config::CredentialSource;
use dockspawn::docker::{
    CreateRequest, ExecOutput, ImageInfo, ObjectState, PublishedPort, Readiness, RuntimeObject,
    StagingRequest,
};
use dockspawn::hub::CredentialFile;
use dockspawn::{
    BackendKind, Endpoint, Hub, LifecycleController, PersistedState, RuntimeBackend,
    SandboxIdentity, SpawnError, SpawnerConfig,
};

/// Every runtime call the controller made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetObject(String),
    Poll(String),
    InspectImage(String),
    PullImage(String),
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    Exec(String),
    StageFiles(String),
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<String, RuntimeObject>,
    images: HashSet<String>,
    calls: Vec<Call>,
    created: Vec<CreateRequest>,
    staged: Vec<StagingRequest>,
    next_id: u64,
    readiness: VecDeque<Readiness>,
    exit_on_start: Option<String>,
    appear_on_pull: Option<String>,
    duplicate_creates: usize,
    /// Lookups a removed object stays visible for, in the `Removing` state.
    linger_on_remove: usize,
    removing: HashMap<String, usize>,
}

impl FakeState {
    fn find(&self, name_or_id: &str) -> Option<&RuntimeObject> {
        self.objects
            .get(name_or_id)
            .or_else(|| self.objects.values().find(|object| object.name == name_or_id))
    }

    fn find_id(&self, name_or_id: &str) -> Option<String> {
        self.find(name_or_id).map(|object| object.id.clone())
    }

    fn insert(&mut self, name: &str, image: &str, env: BTreeMap<String, String>, state: ObjectState) -> String {
        self.next_id += 1;
        let n = self.next_id;
        let id = format!("{n:064x}");
        self.objects.insert(
            id.clone(),
            RuntimeObject {
                id: id.clone(),
                name: name.to_string(),
                image: Some(image.to_string()),
                state,
                env,
                networks: BTreeMap::from([("bridge".to_string(), format!("172.17.0.{n}"))]),
                published_ports: vec![PublishedPort {
                    target: 8888,
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: 40000 + n as u16,
                }],
            },
        );
        id
    }
}

/// In-memory runtime that enforces name uniqueness and records calls.
pub struct FakeBackend {
    kind: BackendKind,
    state: Mutex<FakeState>,
    yields: bool,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            state: Mutex::new(FakeState::default()),
            yields: false,
        }
    }

    /// Lookups and creates give way to other tasks before acting, like a
    /// daemon round trip would.
    pub fn yielding(mut self) -> Self {
        self.yields = true;
        self
    }

    /// Removed objects stay around in `Removing` for `lookups` more lookups.
    pub fn linger_on_remove(&self, lookups: usize) {
        self.state.lock().unwrap().linger_on_remove = lookups;
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    pub fn add_object(&self, name: &str, image: &str, env: &[(&str, &str)], state: ObjectState) -> String {
        let env = env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        self.state.lock().unwrap().insert(name, image, env, state)
    }

    pub fn script_readiness(&self, steps: impl IntoIterator<Item = Readiness>) {
        self.state.lock().unwrap().readiness.extend(steps);
    }

    pub fn exit_on_start(&self, error: &str) {
        self.state.lock().unwrap().exit_on_start = Some(error.to_string());
    }

    /// Simulates a concurrent creator: pulling makes an object with this name appear.
    pub fn appear_on_pull(&self, name: &str) {
        self.state.lock().unwrap().appear_on_pull = Some(name.to_string());
    }

    /// The object exits behind the controller's back.
    pub fn kill(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.find_id(name) {
            if let Some(object) = state.objects.get_mut(&id) {
                object.state = ObjectState::Exited {
                    exit_code: Some(137),
                    error: None,
                    finished_at: Some("2024-05-01T00:00:00Z".to_string()),
                };
            }
        }
    }

    /// The object is removed behind the controller's back.
    pub fn delete(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.find_id(name) {
            state.objects.remove(&id);
        }
    }

    pub fn object(&self, name: &str) -> Option<RuntimeObject> {
        self.state.lock().unwrap().find(name).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|call| pred(call)).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn created(&self) -> Vec<CreateRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn staged(&self) -> Vec<StagingRequest> {
        self.state.lock().unwrap().staged.clone()
    }

    /// Creates issued while an object with the same name was alive.
    pub fn duplicate_creates(&self) -> usize {
        self.state.lock().unwrap().duplicate_creates
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn body_field<'a>(body: &'a Value, kind: BackendKind, field: &str) -> &'a Value {
    match kind {
        BackendKind::Container => &body[field],
        BackendKind::Service => &body["TaskTemplate"]["ContainerSpec"][field],
    }
}

#[async_trait]
impl RuntimeBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn get_object(&self, name_or_id: &str) -> dockspawn::Result<Option<RuntimeObject>> {
        if self.yields {
            tokio::task::yield_now().await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::GetObject(name_or_id.to_string()));
        let Some(id) = state.find_id(name_or_id) else {
            return Ok(None);
        };
        match state.removing.get(&id).copied() {
            Some(0) => {
                state.removing.remove(&id);
                state.objects.remove(&id);
                Ok(None)
            }
            Some(left) => {
                state.removing.insert(id.clone(), left - 1);
                Ok(state.objects.get(&id).cloned())
            }
            None => Ok(state.objects.get(&id).cloned()),
        }
    }

    async fn poll(&self, object: &RuntimeObject) -> dockspawn::Result<Readiness> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Poll(object.name.clone()));
        if let Some(step) = state.readiness.pop_front() {
            return Ok(step);
        }
        Ok(match &object.state {
            ObjectState::Running | ObjectState::Unhealthy => Readiness::Ready,
            ObjectState::Exited { exit_code, .. } => {
                Readiness::Failed(format!("ExitCode={}", exit_code.unwrap_or_default()))
            }
            other => Readiness::Pending(format!("{other:?}")),
        })
    }

    async fn inspect_image(&self, image: &str) -> dockspawn::Result<ImageInfo> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::InspectImage(image.to_string()));
        if state.images.contains(image) {
            Ok(ImageInfo {
                id: format!("sha256:{image}"),
                cmd: Some(vec!["start-notebook.sh".to_string()]),
            })
        } else {
            Err(SpawnError::NotFound(format!("image {image}")))
        }
    }

    async fn pull_image(&self, image: &str) -> dockspawn::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::PullImage(image.to_string()));
        state.images.insert(image.to_string());
        if let Some(name) = state.appear_on_pull.take() {
            state.insert(&name, image, BTreeMap::new(), ObjectState::Running);
        }
        Ok(())
    }

    async fn create(&self, request: CreateRequest) -> dockspawn::Result<String> {
        if self.yields {
            tokio::task::yield_now().await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(request.name.clone()));
        if state.find(&request.name).is_some() {
            state.duplicate_creates += 1;
            return Err(SpawnError::Conflict(format!("name {} is in use", request.name)));
        }
        let image = body_field(&request.body, self.kind, "Image")
            .as_str()
            .unwrap_or_default()
            .to_string();
        let env = body_field(&request.body, self.kind, "Env")
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let initial = match self.kind {
            BackendKind::Container => ObjectState::Created,
            BackendKind::Service => ObjectState::Running,
        };
        let id = state.insert(&request.name, &image, env, initial);
        if self.kind == BackendKind::Service {
            if let Some(object) = state.objects.get_mut(&id) {
                object.networks.clear();
                object.published_ports[0].host_ip = None;
            }
        }
        state.created.push(request);
        Ok(id)
    }

    async fn start(&self, id: &str) -> dockspawn::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Start(id.to_string()));
        let exit = state.exit_on_start.clone();
        let object = state
            .objects
            .get_mut(id)
            .ok_or_else(|| SpawnError::NotFound(format!("object {id}")))?;
        if self.kind == BackendKind::Container {
            object.state = match exit {
                Some(error) => ObjectState::Exited {
                    exit_code: Some(1),
                    error: Some(error),
                    finished_at: None,
                },
                None => ObjectState::Running,
            };
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> dockspawn::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Stop(id.to_string()));
        if self.kind == BackendKind::Container {
            if let Some(object) = state.objects.get_mut(id) {
                object.state = ObjectState::Exited {
                    exit_code: Some(0),
                    error: None,
                    finished_at: None,
                };
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> dockspawn::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Remove(id.to_string()));
        let linger = state.linger_on_remove;
        if linger == 0 {
            state.objects.remove(id);
        } else if let Some(object) = state.objects.get_mut(id) {
            object.state = ObjectState::Removing;
            state.removing.insert(id.to_string(), linger);
        }
        Ok(())
    }

    async fn exec(&self, id: &str, _argv: Vec<String>) -> dockspawn::Result<ExecOutput> {
        self.record(Call::Exec(id.to_string()));
        if self.kind == BackendKind::Service {
            return Err(SpawnError::Config("no exec for services".to_string()));
        }
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: "done\n".to_string(),
            stderr: String::new(),
        })
    }

    async fn stage_files(&self, request: StagingRequest) -> dockspawn::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::StageFiles(request.volume.clone()));
        state.staged.push(request);
        Ok(())
    }
}

/// Framework stand-in keeping everything in memory.
#[derive(Default)]
pub struct MemoryHub {
    states: Mutex<HashMap<SandboxIdentity, PersistedState>>,
    tokens: Mutex<Vec<(String, String)>>,
    endpoints: Mutex<Vec<Endpoint>>,
    credentials: Vec<CredentialFile>,
}

impl MemoryHub {
    pub fn with_credentials(mut self, credentials: Vec<CredentialFile>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn state(&self, identity: &SandboxIdentity) -> PersistedState {
        self.states
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_state(&self, identity: &SandboxIdentity, state: PersistedState) {
        self.states.lock().unwrap().insert(identity.clone(), state);
    }

    pub fn tokens(&self) -> Vec<(String, String)> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Hub for MemoryHub {
    async fn load_state(&self, identity: &SandboxIdentity) -> anyhow::Result<PersistedState> {
        Ok(self.state(identity))
    }

    async fn save_state(&self, identity: &SandboxIdentity, state: &PersistedState) -> anyhow::Result<()> {
        self.set_state(identity, state.clone());
        Ok(())
    }

    async fn env_overrides(&self, identity: &SandboxIdentity) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([(
            "JUPYTERHUB_USER".to_string(),
            identity.raw_username().to_string(),
        )]))
    }

    async fn report_endpoint(&self, _identity: &SandboxIdentity, endpoint: &Endpoint) -> anyhow::Result<()> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        Ok(())
    }

    async fn read_credential_files(&self, _sources: &[CredentialSource]) -> anyhow::Result<Vec<CredentialFile>> {
        Ok(self.credentials.clone())
    }

    async fn restore_api_token(&self, identity: &SandboxIdentity, token: &str) -> anyhow::Result<()> {
        self.tokens
            .lock()
            .unwrap()
            .push((identity.raw_username().to_string(), token.to_string()));
        Ok(())
    }
}

pub const IMAGE: &str = "busybox:1.36";

pub fn config(kind: BackendKind) -> SpawnerConfig {
    SpawnerConfig {
        backend: kind,
        image: IMAGE.to_string(),
        ..SpawnerConfig::default()
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub hub: Arc<MemoryHub>,
    pub controller: LifecycleController,
}

impl Harness {
    pub fn new(config: SpawnerConfig) -> Self {
        Self::with_parts(config, FakeBackend::new(BackendKind::Container).with_image(IMAGE), MemoryHub::default())
    }

    pub fn with_parts(config: SpawnerConfig, backend: FakeBackend, hub: MemoryHub) -> Self {
        let backend = Arc::new(backend);
        let hub = Arc::new(hub);
        let controller = LifecycleController::new(Arc::new(config), backend.clone(), hub.clone());
        Self {
            backend,
            hub,
            controller,
        }
    }

    pub fn identity(&self, user: &str) -> SandboxIdentity {
        self.controller.identity(user, "")
    }
}
