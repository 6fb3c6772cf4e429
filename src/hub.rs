//! The boundary to the framework that hosts the lifecycle core.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::CredentialSource;
use crate::docker::Endpoint;
use crate::naming::{escape, EscapeStrategy, SandboxIdentity};

/// The only state handed back to the framework for durable storage.
///
/// Keys are written only when an object is known to exist; an empty
/// record means there is nothing to reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    /// System-user ids, kept across object removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
}

impl PersistedState {
    pub fn for_object(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object_id: Some(id.into()),
            object_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_object(&self, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object_id: Some(id.into()),
            object_name: Some(name.into()),
            ..self.clone()
        }
    }

    /// Forgets the object but keeps the user ids.
    pub fn without_object(&self) -> Self {
        Self {
            object_id: None,
            object_name: None,
            ..self.clone()
        }
    }

    pub fn has_object(&self) -> bool {
        self.object_id.is_some() || self.object_name.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_object() && self.user_id.is_none() && self.group_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFile {
    pub file_name: String,
    pub contents: Vec<u8>,
    /// Receives the file's in-sandbox path.
    pub env_var: Option<String>,
}

#[async_trait]
pub trait Hub: Send + Sync {
    async fn load_state(&self, identity: &SandboxIdentity) -> Result<PersistedState>;

    async fn save_state(&self, identity: &SandboxIdentity, state: &PersistedState) -> Result<()>;

    /// Extra environment the framework wants in every sandbox; wins over
    /// configured environment.
    async fn env_overrides(&self, identity: &SandboxIdentity) -> Result<BTreeMap<String, String>>;

    async fn report_endpoint(&self, identity: &SandboxIdentity, endpoint: &Endpoint) -> Result<()>;

    async fn read_credential_files(&self, sources: &[CredentialSource]) -> Result<Vec<CredentialFile>>;

    /// An adopted object carried an API token in its environment.
    async fn restore_api_token(&self, identity: &SandboxIdentity, token: &str) -> Result<()>;
}

/// File-backed hub used by the CLI: one JSON state file per identity.
pub struct FileHub {
    state_dir: PathBuf,
    environment: BTreeMap<String, String>,
    tokens: Mutex<HashMap<SandboxIdentity, String>>,
}

impl FileHub {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            environment: BTreeMap::new(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn default_state_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("dockspawn")
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn stem(identity: &SandboxIdentity) -> String {
        let user = escape(identity.raw_username(), EscapeStrategy::Safe);
        if identity.is_default_session() {
            user
        } else {
            format!("{user}--{}", escape(identity.session_name(), EscapeStrategy::Safe))
        }
    }

    fn state_path(&self, identity: &SandboxIdentity) -> PathBuf {
        self.state_dir.join(format!("{}.json", Self::stem(identity)))
    }

    fn endpoint_path(&self, identity: &SandboxIdentity) -> PathBuf {
        self.state_dir.join(format!("{}.endpoint.json", Self::stem(identity)))
    }

    pub async fn load_endpoint(&self, identity: &SandboxIdentity) -> Result<Option<Endpoint>> {
        let path = self.endpoint_path(identity);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("Invalid endpoint file {}", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| format!("Failed to create state dir {}", self.state_dir.display()))?;
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn remove_file(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

#[async_trait]
impl Hub for FileHub {
    async fn load_state(&self, identity: &SandboxIdentity) -> Result<PersistedState> {
        let path = self.state_path(identity);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid state file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn save_state(&self, identity: &SandboxIdentity, state: &PersistedState) -> Result<()> {
        let path = self.state_path(identity);
        if state.is_empty() {
            debug!("Clearing persisted state for {}", identity.label());
            Self::remove_file(&path).await?;
            return Self::remove_file(&self.endpoint_path(identity)).await;
        }
        self.write_json(&path, state).await
    }

    async fn env_overrides(&self, identity: &SandboxIdentity) -> Result<BTreeMap<String, String>> {
        let mut env = self.environment.clone();
        env.insert("JUPYTERHUB_USER".to_string(), identity.raw_username().to_string());
        if !identity.is_default_session() {
            env.insert(
                "JUPYTERHUB_SERVER_NAME".to_string(),
                identity.session_name().to_string(),
            );
        }
        if let Some(token) = self.tokens.lock().await.get(identity) {
            env.insert("JUPYTERHUB_API_TOKEN".to_string(), token.clone());
        }
        Ok(env)
    }

    async fn report_endpoint(&self, identity: &SandboxIdentity, endpoint: &Endpoint) -> Result<()> {
        info!("Sandbox for {} reachable at {}", identity.label(), endpoint);
        self.write_json(&self.endpoint_path(identity), endpoint).await
    }

    async fn read_credential_files(&self, sources: &[CredentialSource]) -> Result<Vec<CredentialFile>> {
        let mut files = Vec::with_capacity(sources.len());
        for source in sources {
            let path = Path::new(&source.path);
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("Credential path {} has no file name", source.path))?
                .to_string();
            let contents = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read credential file {}", source.path))?;
            files.push(CredentialFile {
                file_name,
                contents,
                env_var: source.env_var.clone(),
            });
        }
        Ok(files)
    }

    async fn restore_api_token(&self, identity: &SandboxIdentity, token: &str) -> Result<()> {
        debug!("Keeping existing API token for {}", identity.label());
        self.tokens
            .lock()
            .await
            .insert(identity.clone(), token.to_string());
        Ok(())
    }
}
