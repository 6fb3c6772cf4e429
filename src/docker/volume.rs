use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::naming::{render_name, TemplateNamespace};

/// Right-hand side of a `volumes` / `read_only_volumes` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeTarget {
    Path(String),
    Detailed {
        bind: String,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        propagation: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBind {
    pub bind: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
}

impl VolumeBind {
    pub fn is_read_only(&self) -> bool {
        self.mode.split(',').any(|flag| flag == "ro")
    }
}

/// Resolved host source → guest binding.
///
/// Read-only entries are applied after read-write ones, so a host path
/// declared in both ends up read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeBinds(BTreeMap<String, VolumeBind>);

impl VolumeBinds {
    pub fn resolve(
        read_write: &BTreeMap<String, VolumeTarget>,
        read_only: &BTreeMap<String, VolumeTarget>,
        ns: &TemplateNamespace,
    ) -> Self {
        let mut binds = BTreeMap::new();
        apply(&mut binds, read_write, "rw", ns);
        apply(&mut binds, read_only, "ro", ns);
        Self(binds)
    }

    /// Adds the internal-TLS certificate volume, always read-only.
    pub fn with_certs_volume(mut self, volume: &str, location: &str) -> Self {
        self.0.insert(
            volume.to_string(),
            VolumeBind {
                bind: location.to_string(),
                mode: "ro".to_string(),
                propagation: None,
            },
        );
        self
    }

    /// Binds a host home directory read-write, replacing any configured
    /// entry for the same host path.
    pub fn with_home_dir(mut self, host: &str, location: &str, propagation: Option<&str>) -> Self {
        self.0.insert(
            host.to_string(),
            VolumeBind {
                bind: location.to_string(),
                mode: "rw".to_string(),
                propagation: propagation.map(str::to_string),
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, host: &str) -> Option<&VolumeBind> {
        self.0.get(host)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VolumeBind)> {
        self.0.iter()
    }

    /// Guest paths, sorted.
    pub fn mount_points(&self) -> Vec<String> {
        let mut points: Vec<String> = self.0.values().map(|bind| bind.bind.clone()).collect();
        points.sort();
        points
    }

    /// `HostConfig.Binds` entries: `source:target:mode[,propagation]`.
    pub fn to_bind_strings(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(host, bind)| match &bind.propagation {
                Some(propagation) => {
                    format!("{host}:{}:{},{propagation}", bind.bind, bind.mode)
                }
                None => format!("{host}:{}:{}", bind.bind, bind.mode),
            })
            .collect()
    }

    /// `ContainerSpec.Mounts` entries for services. Sources that are not
    /// absolute paths are named volumes and get the driver config, if any.
    pub fn to_service_mounts(
        &self,
        driver: Option<&str>,
        driver_options: &BTreeMap<String, String>,
    ) -> Vec<Value> {
        self.0
            .iter()
            .map(|(host, bind)| {
                let is_volume = !host.starts_with('/');
                let mut mount = json!({
                    "Type": if is_volume { "volume" } else { "bind" },
                    "Source": host,
                    "Target": bind.bind,
                    "ReadOnly": bind.is_read_only(),
                });
                if is_volume {
                    if let Some(driver) = driver {
                        let mut config = json!({ "Name": driver });
                        if !driver_options.is_empty() {
                            config["Options"] = json!(driver_options);
                        }
                        mount["VolumeOptions"] = json!({ "DriverConfig": config });
                    }
                } else if let Some(propagation) = &bind.propagation {
                    mount["BindOptions"] = json!({ "Propagation": propagation });
                }
                mount
            })
            .collect()
    }
}

fn apply(
    binds: &mut BTreeMap<String, VolumeBind>,
    volumes: &BTreeMap<String, VolumeTarget>,
    default_mode: &str,
    ns: &TemplateNamespace,
) {
    for (host, target) in volumes {
        let bind = match target {
            VolumeTarget::Path(guest) => VolumeBind {
                bind: render_name(guest, ns),
                mode: default_mode.to_string(),
                propagation: None,
            },
            VolumeTarget::Detailed {
                bind,
                mode,
                propagation,
            } => VolumeBind {
                bind: render_name(bind, ns),
                mode: mode.clone().unwrap_or_else(|| default_mode.to_string()),
                propagation: propagation.clone(),
            },
        };
        binds.insert(render_name(host, ns), bind);
    }
}
