//! Deployment settings shared by the drivers, the agent protocol and the
//! tunnel allocator.

use std::ops::RangeInclusive;

use crate::agent::CallbackTokens;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base address (scheme, host, port) at which remote workloads reach
    /// the agent endpoint.
    pub callback_url: String,
    /// Present when callbacks must carry a per-task token.
    pub callback_tokens: Option<CallbackTokens>,
    pub local: LocalSettings,
    /// The private registry as seen from remote backends.
    pub remote_registry: String,
    pub tunnel: TunnelSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            callback_url: "http://127.0.0.1:8080".to_owned(),
            callback_tokens: None,
            local: LocalSettings::default(),
            remote_registry: "dregistry:5000".to_owned(),
            tunnel: TunnelSettings::default(),
        }
    }
}

/// How the local docker backend runs containers.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Docker CLI binary.
    pub docker: String,
    pub network: String,
    /// Host directory under which each task gets `task-<id>` mounted at
    /// `/data`.
    pub data_dir: String,
    /// The private registry as seen from this host.
    pub registry: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            docker: "docker".to_owned(),
            network: "tether_default".to_owned(),
            data_dir: "/data".to_owned(),
            registry: "localhost:5000".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Host name handed back to the operator for connecting.
    pub host: String,
    pub ports: RangeInclusive<u16>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            ports: 7000..=7020,
        }
    }
}
