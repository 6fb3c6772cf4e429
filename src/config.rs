use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::docker::volume::VolumeTarget;
use crate::docker::BackendKind;
use crate::error::SpawnError;
use crate::naming::{EscapeStrategy, Naming, SandboxIdentity, VolumeNaming};

pub const CONFIG_VERSION: u32 = 1;

pub type ComputeFn<T> =
    Arc<dyn Fn(&SandboxIdentity) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// A configuration value that is either fixed or computed per sandbox.
///
/// Configuration files only ever produce `Literal`; embedders install
/// `Computed` values programmatically. Either way the value is resolved
/// once, when the sandbox spec is built.
pub enum Dynamic<T> {
    Literal(T),
    Computed(ComputeFn<T>),
}

impl<T> Dynamic<T>
where
    T: Clone + Send + 'static,
{
    pub fn computed<F, Fut>(f: F) -> Self
    where
        F: Fn(&SandboxIdentity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Dynamic::Computed(Arc::new(move |identity| Box::pin(f(identity))))
    }

    pub async fn resolve(&self, identity: &SandboxIdentity) -> anyhow::Result<T> {
        match self {
            Dynamic::Literal(value) => Ok(value.clone()),
            Dynamic::Computed(compute) => compute(identity).await,
        }
    }

    pub fn literal(&self) -> Option<&T> {
        match self {
            Dynamic::Literal(value) => Some(value),
            Dynamic::Computed(_) => None,
        }
    }
}

impl<T: Clone> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        match self {
            Dynamic::Literal(value) => Dynamic::Literal(value.clone()),
            Dynamic::Computed(compute) => Dynamic::Computed(Arc::clone(compute)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Dynamic::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl<T: Default> Default for Dynamic<T> {
    fn default() -> Self {
        Dynamic::Literal(T::default())
    }
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        Dynamic::Literal(value)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Dynamic<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        T::deserialize(deserializer).map(Dynamic::Literal)
    }
}

/// A byte count, written either as an integer or with a K/M/G/T suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteSize(pub u64);

pub fn parse_byte_size(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    let Some(last) = text.chars().last() else {
        return Err("empty byte size".to_string());
    };
    let exponent = match last.to_ascii_uppercase() {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        _ => {
            return text
                .parse::<u64>()
                .map_err(|_| format!("invalid byte size {text:?}, expected e.g. 512M or 2G"));
        }
    };
    let mantissa: f64 = text[..text.len() - 1]
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size {text:?}, expected e.g. 512M or 2G"))?;
    if !mantissa.is_finite() || mantissa < 0.0 {
        return Err(format!("invalid byte size {text:?}"));
    }
    Ok((mantissa * 1024f64.powi(exponent)) as u64)
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(bytes) => Ok(ByteSize(bytes)),
            Raw::Float(bytes) if bytes >= 0.0 => Ok(ByteSize(bytes as u64)),
            Raw::Float(bytes) => Err(de::Error::custom(format!("negative byte size {bytes}"))),
            Raw::Text(text) => parse_byte_size(&text).map(ByteSize).map_err(de::Error::custom),
        }
    }
}

/// Images a user may request by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedImages {
    /// `"*"`: any image reference is accepted verbatim.
    Any,
    /// Display key → image reference. Empty disables image selection.
    Listed(BTreeMap<String, String>),
}

impl Default for AllowedImages {
    fn default() -> Self {
        AllowedImages::Listed(BTreeMap::new())
    }
}

impl AllowedImages {
    /// Picks the image for a request, rejecting anything not allowed.
    pub fn select(&self, requested: Option<&str>, default_image: &str) -> crate::Result<String> {
        let Some(requested) = requested else {
            return Ok(default_image.to_string());
        };
        match self {
            AllowedImages::Any => Ok(requested.to_string()),
            AllowedImages::Listed(images) => images.get(requested).cloned().ok_or_else(|| {
                let keys: Vec<&str> = images.keys().map(String::as_str).collect();
                SpawnError::Policy(format!(
                    "Image {requested} not in allowed list: {}",
                    keys.join(", ")
                ))
            }),
        }
    }
}

impl<'de> Deserialize<'de> for AllowedImages {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Wildcard(String),
            List(Vec<String>),
            Map(BTreeMap<String, String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Wildcard(text) if text == "*" => Ok(AllowedImages::Any),
            Raw::Wildcard(text) => Err(de::Error::custom(format!(
                "allowed_images must be \"*\", a list or a map, got {text:?}"
            ))),
            Raw::List(images) => Ok(AllowedImages::Listed(
                images.into_iter().map(|image| (image.clone(), image)).collect(),
            )),
            Raw::Map(images) => Ok(AllowedImages::Listed(images)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    Always,
    #[serde(alias = "if-not-present", alias = "IfNotPresent")]
    IfNotPresent,
    Never,
    Skip,
}

/// A command run inside a sandbox: a shell string or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecCommand {
    Shell(String),
    Argv(Vec<String>),
}

impl ExecCommand {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            ExecCommand::Shell(line) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), line.clone()]
            }
            ExecCommand::Argv(argv) => argv.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Unix socket of the engine; the local defaults (`DOCKER_HOST`) when unset.
    pub socket_path: Option<String>,
    pub timeout_secs: u64,
    /// Daemon calls allowed in flight at once across all sandboxes.
    pub max_concurrent_requests: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout_secs: 120,
            max_concurrent_requests: 4,
        }
    }
}

/// A credential file the hub hands over for staging into the certs volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSource {
    pub path: String,
    /// Environment variable that receives the in-sandbox path of the file.
    #[serde(default)]
    pub env_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalTlsConfig {
    pub enabled: bool,
    pub certs_volume_name: String,
    pub certs_location: String,
    /// Files read by the file-backed hub; other hubs supply their own.
    pub files: Vec<CredentialSource>,
}

impl Default for InternalTlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            certs_volume_name: "{prefix}ssl-{username}".to_string(),
            certs_location: "/etc/dockspawn/internal-ssl".to_string(),
            files: Vec::new(),
        }
    }
}

/// Runs each sandbox as the matching host system user, with that user's
/// home directory bound in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemUserConfig {
    pub enabled: bool,
    /// Host home directory; `{username}` is the unescaped name. Empty uses
    /// the passwd entry.
    pub host_homedir_format_string: String,
    /// Home directory inside the sandbox, also its working directory.
    pub image_homedir_format_string: String,
    pub homedir_bind_propagation: Option<String>,
    /// Keep ids and home for the environment but run the process as root.
    pub run_as_root: bool,
}

impl Default for SystemUserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host_homedir_format_string: "/home/{username}".to_string(),
            image_homedir_format_string: "/home/{username}".to_string(),
            homedir_bind_propagation: None,
            run_as_root: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    pub version: u32,
    pub backend: BackendKind,
    pub docker: DockerConfig,

    pub prefix: String,
    pub name_template: Option<String>,
    pub escape: EscapeStrategy,
    pub volume_naming: VolumeNaming,

    pub image: String,
    pub allowed_images: Dynamic<AllowedImages>,
    pub pull_policy: Option<PullPolicy>,
    pub cmd: Option<Vec<String>>,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,

    pub volumes: BTreeMap<String, VolumeTarget>,
    pub read_only_volumes: BTreeMap<String, VolumeTarget>,
    pub mounts: Vec<Value>,
    pub volume_driver: Option<String>,
    pub volume_driver_options: BTreeMap<String, String>,

    pub port: u16,
    pub host_ip: String,
    pub network_name: Option<String>,
    pub use_internal_ip: bool,
    pub use_internal_hostname: Option<bool>,

    pub mem_limit: Dynamic<Option<ByteSize>>,
    pub mem_guarantee: Dynamic<Option<ByteSize>>,
    pub cpu_limit: Dynamic<Option<f64>>,
    pub cpu_guarantee: Dynamic<Option<f64>>,
    pub pids_limit: Option<i64>,

    pub extra_create_kwargs: Dynamic<Map<String, Value>>,
    pub extra_host_config: Dynamic<Map<String, Value>>,
    pub extra_container_spec: Map<String, Value>,
    pub extra_task_spec: Map<String, Value>,
    pub extra_resources_spec: Map<String, Value>,
    pub extra_endpoint_spec: Map<String, Value>,

    pub remove: bool,
    pub post_start_cmd: Option<ExecCommand>,
    pub start_timeout_secs: u64,
    pub internal_tls: InternalTlsConfig,
    pub system_user: SystemUserConfig,
    /// Environment keys whose value in an adopted object is a reusable API token.
    pub token_env_keys: Vec<String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            backend: BackendKind::Container,
            docker: DockerConfig::default(),
            prefix: "jupyter".to_string(),
            name_template: None,
            escape: EscapeStrategy::Safe,
            volume_naming: VolumeNaming::Default,
            image: "quay.io/jupyterhub/singleuser:latest".to_string(),
            allowed_images: Dynamic::default(),
            pull_policy: None,
            cmd: None,
            args: Vec::new(),
            environment: BTreeMap::new(),
            volumes: BTreeMap::new(),
            read_only_volumes: BTreeMap::new(),
            mounts: Vec::new(),
            volume_driver: None,
            volume_driver_options: BTreeMap::new(),
            port: 8888,
            host_ip: "127.0.0.1".to_string(),
            network_name: None,
            use_internal_ip: false,
            use_internal_hostname: None,
            mem_limit: Dynamic::default(),
            mem_guarantee: Dynamic::default(),
            cpu_limit: Dynamic::default(),
            cpu_guarantee: Dynamic::default(),
            pids_limit: None,
            extra_create_kwargs: Dynamic::default(),
            extra_host_config: Dynamic::default(),
            extra_container_spec: Map::new(),
            extra_task_spec: Map::new(),
            extra_resources_spec: Map::new(),
            extra_endpoint_spec: Map::new(),
            remove: false,
            post_start_cmd: None,
            start_timeout_secs: 120,
            internal_tls: InternalTlsConfig::default(),
            system_user: SystemUserConfig::default(),
            token_env_keys: vec![
                "JUPYTERHUB_API_TOKEN".to_string(),
                "JPY_API_TOKEN".to_string(),
            ],
        }
    }
}

/// Old field names still accepted in configuration files.
const RENAMED_FIELDS: &[(&str, &str)] = &[
    ("container_image", "image"),
    ("container_prefix", "prefix"),
    ("image_whitelist", "allowed_images"),
    ("remove_containers", "remove"),
];

impl SpawnerConfig {
    /// Loads configuration from an optional YAML file, then applies
    /// environment overrides (a `.env` file is honoured).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config = Self::from_yaml(&text)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut raw: serde_yaml::Value = serde_yaml::from_str(text)?;
        if raw.is_null() {
            return Ok(Self::default());
        }
        if let serde_yaml::Value::Mapping(map) = &mut raw {
            for (old, new) in RENAMED_FIELDS {
                let Some(value) = map.remove(*old) else {
                    continue;
                };
                warn!("Config field {old} is deprecated, use {new} instead");
                let new_key = serde_yaml::Value::String((*new).to_string());
                if map.contains_key(&new_key) {
                    warn!("Both {old} and {new} are set; ignoring {old}");
                } else {
                    map.insert(new_key, value);
                }
            }
        }
        let config: Self = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(image) = std::env::var("DOCKSPAWN_IMAGE") {
            self.image = image;
        }
        if let Ok(prefix) = std::env::var("DOCKSPAWN_PREFIX") {
            self.prefix = prefix;
        }
        if let Ok(backend) = std::env::var("DOCKSPAWN_BACKEND") {
            match backend.to_lowercase().as_str() {
                "container" => self.backend = BackendKind::Container,
                "service" => self.backend = BackendKind::Service,
                other => warn!("Ignoring unknown DOCKSPAWN_BACKEND value: {other}"),
            }
        }
        if let Ok(socket) = std::env::var("DOCKER_SOCKET") {
            self.docker.socket_path = Some(socket);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version > CONFIG_VERSION {
            anyhow::bail!(
                "config version {} is newer than supported version {CONFIG_VERSION}",
                self.version
            );
        }
        if self.prefix.is_empty() {
            anyhow::bail!("prefix must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.docker.max_concurrent_requests == 0 {
            anyhow::bail!("docker.max_concurrent_requests must be at least 1");
        }
        Ok(())
    }

    pub fn naming(&self) -> Naming {
        Naming {
            prefix: self.prefix.clone(),
            name_template: self.name_template.clone(),
            escape: self.escape,
            volume_naming: self.volume_naming,
        }
    }

    /// Clustered backends default to `skip`: the object may land on any node.
    pub fn effective_pull_policy(&self) -> PullPolicy {
        self.pull_policy.unwrap_or(match self.backend {
            BackendKind::Container => PullPolicy::IfNotPresent,
            BackendKind::Service => PullPolicy::Skip,
        })
    }

    /// The single-host backend attaches to `bridge` unless told otherwise;
    /// services have no default network.
    pub fn effective_network(&self) -> Option<String> {
        match (&self.network_name, self.backend) {
            (Some(name), _) if !name.is_empty() => Some(name.clone()),
            (Some(_), _) => None,
            (None, BackendKind::Container) => Some("bridge".to_string()),
            (None, BackendKind::Service) => None,
        }
    }

    /// Internal TLS certificates are hostname-bound, so it implies
    /// hostname addressing unless explicitly disabled.
    pub fn uses_internal_hostname(&self) -> bool {
        self.use_internal_hostname.unwrap_or(self.internal_tls.enabled)
    }

    /// Services cannot be stopped without being removed.
    pub fn removes_objects(&self) -> bool {
        self.remove || self.backend == BackendKind::Service
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}
