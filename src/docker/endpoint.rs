use std::fmt;

use serde::{Deserialize, Serialize};

use super::{BackendKind, RuntimeObject};
use crate::config::SpawnerConfig;
use crate::error::{Result, SpawnError};

/// Where the proxy should send a sandbox's traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub kind: BackendKind,
    pub use_internal_hostname: bool,
    pub use_internal_ip: bool,
    pub network_name: Option<String>,
    pub port: u16,
    /// Connectable address substituted for wildcard publish addresses.
    pub host_ip: String,
}

impl EndpointPolicy {
    pub fn from_config(config: &SpawnerConfig) -> Self {
        Self {
            kind: config.backend,
            use_internal_hostname: config.uses_internal_hostname(),
            use_internal_ip: config.use_internal_ip,
            network_name: config.effective_network(),
            port: config.port,
            host_ip: config.host_ip.clone(),
        }
    }
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "" | "0.0.0.0" | "::" | "[::]")
}

pub fn resolve_endpoint(object: &RuntimeObject, policy: &EndpointPolicy) -> Result<Endpoint> {
    if policy.use_internal_hostname
        || (policy.use_internal_ip && policy.kind == BackendKind::Service)
    {
        return Ok(Endpoint {
            ip: object.name.clone(),
            port: policy.port,
        });
    }

    if policy.use_internal_ip {
        let Some(network) = policy.network_name.as_deref() else {
            return Err(SpawnError::Config(format!(
                "use_internal_ip is set but no network is configured for {}",
                object.name
            )));
        };
        return match object.networks.get(network) {
            Some(ip) if !ip.is_empty() => Ok(Endpoint {
                ip: ip.clone(),
                port: policy.port,
            }),
            _ => {
                let attached: Vec<&str> = object.networks.keys().map(String::as_str).collect();
                Err(SpawnError::Config(format!(
                    "Unable to find IP address for {} on network '{network}' (attached networks: {})",
                    object.name,
                    attached.join(", ")
                )))
            }
        };
    }

    let published = object
        .published_ports
        .iter()
        .find(|port| port.target == policy.port)
        .ok_or_else(|| {
            SpawnError::Config(format!(
                "{} {} has no published port for {}",
                policy.kind.object_type(),
                object.name,
                policy.port
            ))
        })?;
    let ip = match published.host_ip.as_deref() {
        Some(host) if !is_wildcard(host) => host.to_string(),
        _ => policy.host_ip.clone(),
    };
    Ok(Endpoint {
        ip,
        port: published.host_port,
    })
}
