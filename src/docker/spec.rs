use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::volume::VolumeBinds;
use super::{BackendKind, CreateRequest, LABEL_MANAGED, LABEL_SESSION, LABEL_USER};
use crate::config::{Dynamic, SpawnerConfig};
use crate::error::{Result, SpawnError};
use crate::naming::{render_name, render_value, SandboxIdentity};

pub const DEFAULT_CPU_PERIOD: i64 = 100_000;

/// Desired state of one sandbox, with every computed value resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub binds: VolumeBinds,
    pub mounts: Vec<Value>,
    pub port: u16,
    /// Request a host-side port binding; off when addressing is runtime-internal.
    pub publish_port: bool,
    pub host_ip: String,
    pub network: Option<String>,
    pub mem_limit: Option<u64>,
    pub mem_guarantee: Option<u64>,
    pub cpu_limit: Option<f64>,
    pub cpu_guarantee: Option<f64>,
    pub pids_limit: Option<i64>,
    pub volume_driver: Option<String>,
    pub volume_driver_options: BTreeMap<String, String>,
    pub extra_create_kwargs: Map<String, Value>,
    pub extra_host_config: Map<String, Value>,
    pub extra_container_spec: Map<String, Value>,
    pub extra_task_spec: Map<String, Value>,
    pub extra_resources_spec: Map<String, Value>,
    pub extra_endpoint_spec: Map<String, Value>,
    /// Named volume receiving internal-TLS credentials, when enabled.
    pub certs_volume: Option<String>,
    pub certs_location: String,
    pub post_start_cmd: Option<Vec<String>>,
    /// Process user as `uid[:gid]`, set in system-user mode.
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub user_id: Option<u32>,
    pub group_id: Option<u32>,
}

async fn evaluate<T>(name: &str, value: &Dynamic<T>, identity: &SandboxIdentity) -> Result<T>
where
    T: Clone + Send + 'static,
{
    value
        .resolve(identity)
        .await
        .map_err(|e| SpawnError::Config(format!("failed to compute {name}: {e:#}")))
}

impl SandboxSpec {
    /// Resolves the configuration for one identity. Image selection is
    /// checked against the allowed set here, before anything touches the
    /// runtime.
    pub async fn resolve(
        config: &SpawnerConfig,
        identity: &SandboxIdentity,
        requested_image: Option<&str>,
    ) -> Result<Self> {
        let allowed = evaluate("allowed_images", &config.allowed_images, identity).await?;
        let image = allowed.select(requested_image, &config.image)?;

        let naming = config.naming();
        let ns = naming.namespace(identity, &image);
        let volume_ns = naming.volume_namespace(identity, &image);

        let mut binds =
            VolumeBinds::resolve(&config.volumes, &config.read_only_volumes, &volume_ns);
        let certs_volume = if config.internal_tls.enabled {
            let volume = render_name(&config.internal_tls.certs_volume_name, &volume_ns);
            binds = binds.with_certs_volume(&volume, &config.internal_tls.certs_location);
            Some(volume)
        } else {
            None
        };
        let mounts = config
            .mounts
            .iter()
            .map(|mount| render_value(mount, &volume_ns))
            .collect();

        let labels = BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_USER.to_string(), identity.raw_username().to_string()),
            (LABEL_SESSION.to_string(), identity.session_name().to_string()),
        ]);

        let render_map = |map: Map<String, Value>| -> Map<String, Value> {
            match render_value(&Value::Object(map), &ns) {
                Value::Object(rendered) => rendered,
                _ => Map::new(),
            }
        };

        Ok(Self {
            cmd: config.cmd.clone(),
            args: config.args.clone(),
            environment: config.environment.clone(),
            labels,
            binds,
            mounts,
            port: config.port,
            publish_port: !(config.use_internal_ip || config.uses_internal_hostname()),
            host_ip: config.host_ip.clone(),
            network: config.effective_network(),
            mem_limit: evaluate("mem_limit", &config.mem_limit, identity)
                .await?
                .map(|size| size.0),
            mem_guarantee: evaluate("mem_guarantee", &config.mem_guarantee, identity)
                .await?
                .map(|size| size.0),
            cpu_limit: evaluate("cpu_limit", &config.cpu_limit, identity).await?,
            cpu_guarantee: evaluate("cpu_guarantee", &config.cpu_guarantee, identity).await?,
            pids_limit: config.pids_limit,
            volume_driver: config.volume_driver.clone(),
            volume_driver_options: config.volume_driver_options.clone(),
            extra_create_kwargs: render_map(
                evaluate("extra_create_kwargs", &config.extra_create_kwargs, identity).await?,
            ),
            extra_host_config: render_map(
                evaluate("extra_host_config", &config.extra_host_config, identity).await?,
            ),
            extra_container_spec: render_map(config.extra_container_spec.clone()),
            extra_task_spec: render_map(config.extra_task_spec.clone()),
            extra_resources_spec: render_map(config.extra_resources_spec.clone()),
            extra_endpoint_spec: render_map(config.extra_endpoint_spec.clone()),
            certs_volume,
            certs_location: config.internal_tls.certs_location.clone(),
            post_start_cmd: config.post_start_cmd.as_ref().map(|cmd| cmd.to_argv()),
            user: None,
            working_dir: None,
            user_id: None,
            group_id: None,
            image,
        })
    }

    /// True when the final command depends on the image's default command.
    pub fn needs_image_command(&self) -> bool {
        self.cmd.is_none() && !self.args.is_empty()
    }

    /// An explicit command is used verbatim; otherwise extra args are
    /// appended to the image default. `None` keeps the image default.
    pub fn command(&self, image_default: Option<&[String]>) -> Option<Vec<String>> {
        if let Some(cmd) = &self.cmd {
            return Some(cmd.clone());
        }
        if self.args.is_empty() {
            return None;
        }
        let mut command = image_default.map(<[String]>::to_vec).unwrap_or_default();
        command.extend(self.args.iter().cloned());
        Some(command)
    }

    fn env_list(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// Deep merge: maps merge key by key, everything else is replaced.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Builds the runtime creation request for a resolved spec.
///
/// Layers, later wins: computed defaults, derived resource and network
/// fields, then the user's extra overrides.
pub struct SpecBuilder<'a> {
    kind: BackendKind,
    spec: &'a SandboxSpec,
}

impl<'a> SpecBuilder<'a> {
    pub fn new(kind: BackendKind, spec: &'a SandboxSpec) -> Self {
        Self { kind, spec }
    }

    pub fn build(&self, name: &str, command: Option<Vec<String>>) -> CreateRequest {
        let body = match self.kind {
            BackendKind::Container => self.container_body(command),
            BackendKind::Service => self.service_body(name, command),
        };
        debug!("Built {} request for {}: {}", self.kind.object_type(), name, body);
        CreateRequest {
            name: name.to_string(),
            body,
        }
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.spec.port)
    }

    fn container_body(&self, command: Option<Vec<String>>) -> Value {
        let spec = self.spec;
        let mut exposed = Map::new();
        exposed.insert(self.port_key(), json!({}));

        let mut body = json!({
            "Image": spec.image,
            "Env": spec.env_list(),
            "Labels": spec.labels,
            "ExposedPorts": exposed,
            "HostConfig": {
                "Binds": spec.binds.to_bind_strings(),
            },
        });
        if let Some(command) = command {
            body["Cmd"] = json!(command);
        }
        if let Some(dir) = &spec.working_dir {
            body["WorkingDir"] = json!(dir);
        }
        if let Some(user) = &spec.user {
            body["User"] = json!(user);
        }
        let mount_points = spec.binds.mount_points();
        if !mount_points.is_empty() {
            let volumes: Map<String, Value> = mount_points
                .into_iter()
                .map(|point| (point, json!({})))
                .collect();
            body["Volumes"] = Value::Object(volumes);
        }
        if !spec.mounts.is_empty() {
            body["HostConfig"]["Mounts"] = json!(spec.mounts);
        }
        if spec.publish_port {
            let mut bindings = Map::new();
            bindings.insert(
                self.port_key(),
                json!([{ "HostIp": spec.host_ip, "HostPort": "" }]),
            );
            body["HostConfig"]["PortBindings"] = Value::Object(bindings);
        }

        let mut derived = Map::new();
        if let Some(network) = &spec.network {
            derived.insert("NetworkMode".into(), json!(network));
        }
        if let Some(memory) = spec.mem_limit {
            derived.insert("Memory".into(), json!(memory));
        }
        if let Some(memory) = spec.mem_guarantee {
            derived.insert("MemoryReservation".into(), json!(memory));
        }
        if let Some(cpus) = spec.cpu_limit {
            let period = spec
                .extra_host_config
                .get("CpuPeriod")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_CPU_PERIOD);
            derived.insert("CpuPeriod".into(), json!(period));
            derived.insert("CpuQuota".into(), json!((period as f64 * cpus) as i64));
        }
        if let Some(pids) = spec.pids_limit {
            derived.insert("PidsLimit".into(), json!(pids));
        }
        merge_json(&mut body["HostConfig"], &Value::Object(derived));
        merge_json(
            &mut body["HostConfig"],
            &Value::Object(spec.extra_host_config.clone()),
        );
        merge_json(&mut body, &Value::Object(spec.extra_create_kwargs.clone()));
        body
    }

    fn service_body(&self, name: &str, command: Option<Vec<String>>) -> Value {
        let spec = self.spec;
        let mut mounts = spec
            .binds
            .to_service_mounts(spec.volume_driver.as_deref(), &spec.volume_driver_options);
        mounts.extend(spec.mounts.iter().cloned());

        let mut container_spec = json!({
            "Image": spec.image,
            "Env": spec.env_list(),
            "Labels": spec.labels,
            "Mounts": mounts,
        });
        if let Some(command) = command {
            container_spec["Args"] = json!(command);
        }
        if let Some(dir) = &spec.working_dir {
            container_spec["Dir"] = json!(dir);
        }
        if let Some(user) = &spec.user {
            container_spec["User"] = json!(user);
        }
        merge_json(
            &mut container_spec,
            &Value::Object(spec.extra_container_spec.clone()),
        );

        let mut limits = Map::new();
        if let Some(cpus) = spec.cpu_limit {
            limits.insert("NanoCPUs".into(), json!((cpus * 1e9) as i64));
        }
        if let Some(memory) = spec.mem_limit {
            limits.insert("MemoryBytes".into(), json!(memory));
        }
        if let Some(pids) = spec.pids_limit {
            limits.insert("Pids".into(), json!(pids));
        }
        let mut reservations = Map::new();
        if let Some(cpus) = spec.cpu_guarantee {
            reservations.insert("NanoCPUs".into(), json!((cpus * 1e9) as i64));
        }
        if let Some(memory) = spec.mem_guarantee {
            reservations.insert("MemoryBytes".into(), json!(memory));
        }
        let mut resources = Map::new();
        if !limits.is_empty() {
            resources.insert("Limits".into(), Value::Object(limits));
        }
        if !reservations.is_empty() {
            resources.insert("Reservations".into(), Value::Object(reservations));
        }
        let mut resources = Value::Object(resources);
        merge_json(
            &mut resources,
            &Value::Object(spec.extra_resources_spec.clone()),
        );

        let mut task = json!({
            "ContainerSpec": container_spec,
            "Resources": resources,
        });
        if let Some(network) = &spec.network {
            task["Networks"] = json!([{ "Target": network }]);
        }
        merge_json(&mut task, &Value::Object(spec.extra_task_spec.clone()));

        let mut endpoint = json!({});
        if spec.publish_port {
            endpoint["Ports"] = json!([{ "Protocol": "tcp", "TargetPort": spec.port }]);
        }
        merge_json(
            &mut endpoint,
            &Value::Object(spec.extra_endpoint_spec.clone()),
        );

        let mut body = json!({
            "Name": name,
            "Labels": spec.labels,
            "TaskTemplate": task,
            "EndpointSpec": endpoint,
        });
        merge_json(&mut body, &Value::Object(spec.extra_create_kwargs.clone()));
        body
    }
}
