//! Cluster configuration.
//!
//! A cluster is declared in a TOML or JSON file (chosen by extension) and can
//! be adjusted through `CONVERGENT_*` environment variables. Fields that the
//! tool can detect accept the string `"auto"` (or an empty string), which is
//! normalised to `None` on load.
//!
//! ```toml
//! overlay_provider = "netbird"
//!
//! [vrrp]
//! enabled = true
//! virtual_ip = "auto"
//!
//! [[nodes]]
//! host = "10.0.0.11"
//! username = "root"
//! private_key_path = "~/.ssh/id_ed25519"
//! role = "manager"
//! [nodes.vrrp]
//! enabled = true
//! priority = "auto"
//! ```

pub mod env;
pub mod file;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use convergent_exec::HostAuthConfig;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, Result};
use crate::probe::OverlayProvider;
use crate::vrrp::{
    DEFAULT_BASE_PRIORITY, DEFAULT_ROUTER_ID, MAX_PRIORITY, MIN_PRIORITY, VirtualIp, VrrpNodeSpec,
    VrrpSettings, VrrpState,
};

pub use env::EnvConfig;
pub use file::ConfigFormat;

/// Role of a node in the container cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the cluster control plane.
    #[default]
    Manager,
    /// Runs workloads only.
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manager => "manager",
            Self::Worker => "worker",
        })
    }
}

/// The declared cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Overlay network whose addresses pre-empt interface scanning.
    pub overlay_provider: OverlayProvider,
    /// Cluster-wide VRRP settings.
    pub vrrp: VrrpConfig,
    /// Nodes, in declared order. Order decides VRRP priority.
    pub nodes: Vec<NodeConfig>,
}

/// Cluster-wide VRRP settings as declared.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VrrpConfig {
    /// Whether VRRP is deployed.
    pub enabled: bool,
    /// Interface carrying the virtual IP; `None` means detect.
    #[serde(deserialize_with = "auto_string")]
    pub interface: Option<String>,
    /// Virtual IP, optionally with a prefix; `None` means probe.
    #[serde(deserialize_with = "auto_string")]
    pub virtual_ip: Option<String>,
    /// Virtual router id.
    pub router_id: u8,
    /// Shared secret; `None` means generate.
    #[serde(deserialize_with = "auto_string")]
    pub auth_pass: Option<String>,
    /// Priority of the first VRRP node.
    pub base_priority: u8,
}

impl Default for VrrpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: None,
            virtual_ip: None,
            router_id: DEFAULT_ROUTER_ID,
            auth_pass: None,
            base_priority: DEFAULT_BASE_PRIORITY,
        }
    }
}

/// One declared node.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    /// Host name or address used to reach the node.
    pub host: String,
    /// Login user.
    pub username: String,
    /// Password credential.
    #[serde(default)]
    pub password: Option<String>,
    /// Inline private key credential.
    #[serde(default)]
    pub private_key_pem: Option<String>,
    /// Private key file credential; `~/` expands to the home directory.
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// Passphrase of an encrypted key.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// SSH port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Cluster role.
    #[serde(default)]
    pub role: NodeRole,
    /// Per-node VRRP settings.
    #[serde(default)]
    pub vrrp: NodeVrrpConfig,
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_pem", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("role", &self.role)
            .field("vrrp", &self.vrrp)
            .finish()
    }
}

/// Per-node VRRP settings as declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeVrrpConfig {
    /// Whether the node takes part.
    pub enabled: bool,
    /// Priority override; `None` means derive from position.
    #[serde(deserialize_with = "auto_priority")]
    pub priority: Option<u8>,
    /// State override; `None` means derive from position.
    #[serde(deserialize_with = "auto_state")]
    pub state: Option<VrrpState>,
}

fn is_auto(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("auto")
}

fn auto_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !is_auto(v)).map(|v| v.trim().to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AutoOrNumber {
    Number(i64),
    Text(String),
}

fn auto_priority<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Option::<AutoOrNumber>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(AutoOrNumber::Text(text)) if is_auto(&text) => return Ok(None),
        Some(AutoOrNumber::Text(text)) => text.trim().parse::<i64>().map_err(|_| {
            de::Error::custom(format!("priority '{text}' is neither \"auto\" nor a number"))
        })?,
        Some(AutoOrNumber::Number(n)) => n,
    };
    u8::try_from(number)
        .ok()
        .filter(|p| (MIN_PRIORITY..=MAX_PRIORITY).contains(p))
        .map(Some)
        .ok_or_else(|| {
            de::Error::custom(format!(
                "priority {number} out of range {MIN_PRIORITY}-{MAX_PRIORITY}"
            ))
        })
}

fn auto_state<'de, D>(deserializer: D) -> std::result::Result<Option<VrrpState>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(text) if !is_auto(&text) => text.parse().map(Some).map_err(de::Error::custom),
        _ => Ok(None),
    }
}

impl ClusterConfig {
    /// Load from a file, apply `CONVERGENT_*` overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: Self = file::load_file(path)?;
        config.apply_env(&EnvConfig::default())?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            nodes = config.nodes.len(),
            vrrp = config.vrrp.enabled,
            "loaded cluster configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text. The environment is not read.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: Self = file::parse_config(content, format)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self, env: &EnvConfig) -> Result<()> {
        if let Some(provider) = env.get(env::vars::OVERLAY_PROVIDER) {
            self.overlay_provider = provider.parse()?;
        }
        if let Some(enabled) = env.bool(env::vars::VRRP_ENABLED) {
            self.vrrp.enabled = enabled;
        }
        if let Some(interface) = env.get(env::vars::VRRP_INTERFACE) {
            self.vrrp.interface = Some(interface).filter(|v| !is_auto(v));
        }
        if let Some(vip) = env.get(env::vars::VRRP_VIRTUAL_IP) {
            self.vrrp.virtual_ip = Some(vip).filter(|v| !is_auto(v));
        }
        Ok(())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ConvergeError::config("no nodes configured"));
        }

        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let host = node.host.trim();
            if host.is_empty() {
                return Err(ConvergeError::config("node with empty host"));
            }
            if !seen.insert(host) {
                return Err(ConvergeError::config(format!("duplicate node host '{host}'")));
            }
            node.auth()?;
            if self.vrrp.enabled && node.vrrp.enabled && node.role != NodeRole::Manager {
                return Err(ConvergeError::config(format!(
                    "node '{host}' has VRRP enabled but is a {}; the health check needs a manager",
                    node.role
                )));
            }
        }

        if self.vrrp.router_id == 0 {
            return Err(ConvergeError::config("vrrp.router_id must be 1-255"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.vrrp.base_priority) {
            return Err(ConvergeError::config(format!(
                "vrrp.base_priority must be {MIN_PRIORITY}-{MAX_PRIORITY}"
            )));
        }
        self.vrrp_settings()?;
        Ok(())
    }

    /// Declared hosts, in order.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.host.as_str()).collect()
    }

    /// Authentication settings of every node, keyed by host.
    pub fn auth_map(&self) -> Result<HashMap<String, HostAuthConfig>> {
        self.nodes
            .iter()
            .map(|node| Ok((node.host.clone(), node.auth()?)))
            .collect()
    }

    /// Planner settings.
    pub fn vrrp_settings(&self) -> Result<VrrpSettings> {
        let virtual_ip = self
            .vrrp
            .virtual_ip
            .as_deref()
            .map(str::parse::<VirtualIp>)
            .transpose()?;
        Ok(VrrpSettings {
            enabled: self.vrrp.enabled,
            interface: self.vrrp.interface.clone(),
            virtual_ip,
            router_id: self.vrrp.router_id,
            auth_pass: self.vrrp.auth_pass.clone(),
            base_priority: self.vrrp.base_priority,
            ..VrrpSettings::default()
        })
    }

    /// Every node as a VRRP participant, in declared order.
    #[must_use]
    pub fn vrrp_specs(&self) -> Vec<VrrpNodeSpec> {
        self.nodes
            .iter()
            .map(|node| VrrpNodeSpec {
                host: node.host.clone(),
                enabled: node.vrrp.enabled,
                priority: node.vrrp.priority,
                state: node.vrrp.state,
            })
            .collect()
    }
}

impl NodeConfig {
    /// Authentication settings, requiring exactly one credential.
    pub fn auth(&self) -> Result<HostAuthConfig> {
        let key_path = self.private_key_path.as_deref().map(env::expand_home);
        let mut auth = HostAuthConfig::from_parts(
            &self.host,
            &self.username,
            self.password.as_deref(),
            self.private_key_pem.as_deref(),
            key_path.as_deref(),
        )?;
        if let Some(passphrase) = self.passphrase.as_deref().filter(|p| !p.is_empty()) {
            auth = auth.with_passphrase(passphrase);
        }
        if let Some(port) = self.port {
            auth = auth.with_port(port);
        }
        auth.validate(&self.host)?;
        Ok(auth)
    }
}
