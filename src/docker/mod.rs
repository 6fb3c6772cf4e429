mod client;
mod container;
pub mod endpoint;
pub mod lifecycle;
mod service;
pub mod spec;
pub mod system_user;
pub mod volume;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::hub::CredentialFile;

pub use client::{classify, classify_lookup, split_image_reference, DockerClient};
pub use container::ContainerBackend;
pub use endpoint::{resolve_endpoint, Endpoint, EndpointPolicy};
pub use lifecycle::{Backoff, LifecycleController, SandboxStatus};
pub use service::ServiceBackend;
pub use spec::{merge_json, SandboxSpec, SpecBuilder};

pub const LABEL_MANAGED: &str = "dockspawn.managed";
pub const LABEL_USER: &str = "dockspawn.user";
pub const LABEL_SESSION: &str = "dockspawn.session";

/// Which structural variant of the runtime hosts sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One engine container per sandbox.
    #[default]
    Container,
    /// One swarm service per sandbox; tasks are scheduled by the cluster.
    Service,
}

impl BackendKind {
    pub fn object_type(self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Service => "service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    Creating,
    Created,
    Starting,
    Running,
    Unhealthy,
    Exited {
        exit_code: Option<i64>,
        error: Option<String>,
        finished_at: Option<String>,
    },
    Removing,
}

impl ObjectState {
    pub fn is_running(&self) -> bool {
        matches!(self, ObjectState::Running | ObjectState::Unhealthy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    pub target: u16,
    pub host_ip: Option<String>,
    pub host_port: u16,
}

/// What the runtime reports about an existing sandbox object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeObject {
    pub id: String,
    pub name: String,
    /// Image reference the object was created from.
    pub image: Option<String>,
    pub state: ObjectState,
    pub env: BTreeMap<String, String>,
    /// Attached network name → address on that network.
    pub networks: BTreeMap<String, String>,
    pub published_ports: Vec<PublishedPort>,
}

/// Result of one readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Still coming up; the string says what the runtime reports.
    Pending(String),
    /// Terminal, will not become ready without intervention.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

/// A fully built creation request in Docker Engine API shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub body: Value,
}

/// Credential files to place into a named volume before the sandbox starts.
#[derive(Debug, Clone)]
pub struct StagingRequest {
    pub volume: String,
    pub image: String,
    pub files: Vec<CredentialFile>,
    pub labels: BTreeMap<String, String>,
}

/// Backend-specific runtime operations driven by [`LifecycleController`].
///
/// Implementations classify every daemon error once, at the call site.
/// `get_object` absorbs "absent" errors into `Ok(None)`; `stop` and
/// `remove` treat already-gone objects as success.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get_object(&self, name_or_id: &str) -> Result<Option<RuntimeObject>>;

    async fn poll(&self, object: &RuntimeObject) -> Result<Readiness>;

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Returns the runtime-assigned object id.
    async fn create(&self, request: CreateRequest) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn exec(&self, id: &str, argv: Vec<String>) -> Result<ExecOutput>;

    /// Writes `files` into the root of `request.volume`.
    async fn stage_files(&self, request: StagingRequest) -> Result<()>;
}
