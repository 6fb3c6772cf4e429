//! Per-user sandbox lifecycle on Docker: naming, spec building, and the
//! create/start/wait/teardown state machine for containers and swarm
//! services.

pub mod config;
pub mod docker;
pub mod error;
pub mod hub;
pub mod naming;
pub mod shared;

pub use config::{Dynamic, PullPolicy, SpawnerConfig};
pub use docker::{
    BackendKind, DockerClient, Endpoint, LifecycleController, RuntimeBackend, SandboxSpec,
    SandboxStatus,
};
pub use error::{FailureClass, Result, SpawnError};
pub use hub::{FileHub, Hub, PersistedState};
pub use naming::{escape, EscapeStrategy, SandboxIdentity};
