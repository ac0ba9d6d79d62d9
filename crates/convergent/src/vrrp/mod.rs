//! VRRP virtual-IP planning.
//!
//! Given the ordered list of nodes that take part in failover, the planner
//! decides which interface carries the virtual IP, which address to use,
//! each node's priority and initial state, and the shared secret. Leadership
//! is static: the first node leads, and priorities fall by one per position.
//! Nothing here elects or re-elects; keepalived does that at runtime.
//!
//! # Example
//!
//! ```ignore
//! use convergent::vrrp::{VrrpNodeSpec, VrrpPlanner, VrrpSettings};
//!
//! let planner = VrrpPlanner::new(probe, VrrpSettings::default());
//! let nodes = vec![VrrpNodeSpec::new("10.0.0.11"), VrrpNodeSpec::new("10.0.0.12")];
//! let deployment = planner.plan(&nodes).await?;
//! ```

pub mod apply;
pub mod keepalived;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::address::{AddressClass, InterfaceAddress, Ipv4Cidr};
use crate::error::{ConvergeError, Result};
use crate::probe::{AddressUse, HostProbe};

pub use apply::apply_deployment;
pub use keepalived::KeepalivedConf;

/// Default base priority of the first node.
pub const DEFAULT_BASE_PRIORITY: u8 = 100;
/// Default virtual router id.
pub const DEFAULT_ROUTER_ID: u8 = 51;
/// Default VRRP instance name.
pub const DEFAULT_INSTANCE: &str = "VI_1";
/// Default advertisement interval in seconds.
pub const DEFAULT_ADVERT_INT: u8 = 1;
/// Length of a generated shared secret; VRRP PASS auth truncates at 8.
pub const AUTH_PASS_LENGTH: usize = 8;
/// Number of virtual-IP candidates probed.
pub const VIP_CANDIDATES: usize = 10;
/// Lowest valid priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest valid priority.
pub const MAX_PRIORITY: u8 = 254;

/// Interface name prefixes that never carry the virtual IP.
const VIRTUAL_INTERFACE_PREFIXES: &[&str] = &[
    "docker", "br-", "veth", "wg", "tun", "tailscale", "wt", "nb-",
];

/// Initial VRRP state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VrrpState {
    /// Starts as the holder of the virtual IP.
    Leader,
    /// Starts as a standby.
    Backup,
}

impl VrrpState {
    /// The keepalived keyword.
    #[must_use]
    pub const fn keepalived_keyword(self) -> &'static str {
        match self {
            Self::Leader => "MASTER",
            Self::Backup => "BACKUP",
        }
    }
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Leader => "LEADER",
            Self::Backup => "BACKUP",
        })
    }
}

impl FromStr for VrrpState {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "LEADER" | "MASTER" => Ok(Self::Leader),
            "BACKUP" => Ok(Self::Backup),
            other => Err(ConvergeError::config(format!(
                "unknown VRRP state '{other}' (expected leader or backup)"
            ))),
        }
    }
}

/// A requested virtual IP, with or without a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualIp {
    /// The address.
    pub addr: Ipv4Addr,
    /// Prefix length; the interface prefix applies when absent.
    pub prefix: Option<u8>,
}

impl FromStr for VirtualIp {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains('/') {
            let cidr: Ipv4Cidr = s.parse()?;
            Ok(Self {
                addr: cidr.addr(),
                prefix: Some(cidr.prefix()),
            })
        } else {
            let addr = s
                .trim()
                .parse()
                .map_err(|_| ConvergeError::invalid_address(s, "not an IPv4 address"))?;
            Ok(Self { addr, prefix: None })
        }
    }
}

/// Cluster-wide VRRP settings. `None` means detect or generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpSettings {
    /// Whether VRRP is deployed at all.
    pub enabled: bool,
    /// Interface carrying the virtual IP.
    pub interface: Option<String>,
    /// The virtual IP.
    pub virtual_ip: Option<VirtualIp>,
    /// Virtual router id.
    pub router_id: u8,
    /// Shared secret.
    pub auth_pass: Option<String>,
    /// Priority of the first node.
    pub base_priority: u8,
    /// VRRP instance name.
    pub instance: String,
    /// Advertisement interval in seconds.
    pub advert_int: u8,
}

impl Default for VrrpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: None,
            virtual_ip: None,
            router_id: DEFAULT_ROUTER_ID,
            auth_pass: None,
            base_priority: DEFAULT_BASE_PRIORITY,
            instance: DEFAULT_INSTANCE.to_string(),
            advert_int: DEFAULT_ADVERT_INT,
        }
    }
}

/// One node taking part in VRRP, in cluster order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpNodeSpec {
    /// Host name as configured.
    pub host: String,
    /// Whether this node takes part.
    pub enabled: bool,
    /// Priority override.
    pub priority: Option<u8>,
    /// State override.
    pub state: Option<VrrpState>,
}

impl VrrpNodeSpec {
    /// An enabled node with no overrides.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            enabled: true,
            priority: None,
            state: None,
        }
    }

    /// Override the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the state.
    #[must_use]
    pub const fn with_state(mut self, state: VrrpState) -> Self {
        self.state = Some(state);
        self
    }

    /// Exclude this node.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Per-node VRRP configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VrrpNodeConfig {
    /// Host name.
    pub hostname: String,
    /// Priority, 1 to 254.
    pub priority: u8,
    /// Initial state.
    pub state: VrrpState,
    /// Interface carrying the virtual IP.
    pub interface: String,
    /// Virtual IP with prefix.
    pub vip_cidr: Ipv4Cidr,
}

/// The computed VRRP deployment. Recomputed on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VrrpDeployment {
    /// Whether VRRP is deployed.
    pub enabled: bool,
    /// The virtual IP.
    pub virtual_ip: Ipv4Addr,
    /// Virtual IP with prefix.
    pub vip_cidr: Ipv4Cidr,
    /// Interface carrying the virtual IP.
    pub interface: String,
    /// Virtual router id.
    pub router_id: u8,
    /// Shared secret.
    #[serde(skip)]
    pub auth_pass: String,
    /// VRRP instance name.
    pub instance: String,
    /// Advertisement interval in seconds.
    pub advert_int: u8,
    /// Nodes in cluster order.
    pub nodes: Vec<VrrpNodeConfig>,
}

impl VrrpDeployment {
    /// The rendered keepalived configuration of every node.
    #[must_use]
    pub fn rendered_configs(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .map(|node| {
                (
                    node.hostname.clone(),
                    KeepalivedConf::for_node(self, node).render(),
                )
            })
            .collect()
    }

    /// The leading node, if any.
    #[must_use]
    pub fn leader(&self) -> Option<&VrrpNodeConfig> {
        self.nodes.iter().find(|n| n.state == VrrpState::Leader)
    }
}

/// Priority and state of each enabled node, in order.
///
/// Priority is `base - index` clamped to 1..=254 unless overridden; the
/// first node leads unless overridden.
#[must_use]
pub fn assign_roles(nodes: &[&VrrpNodeSpec], base_priority: u8) -> Vec<(u8, VrrpState)> {
    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let offset = u8::try_from(index).unwrap_or(u8::MAX);
            let priority = node
                .priority
                .unwrap_or_else(|| base_priority.saturating_sub(offset))
                .clamp(MIN_PRIORITY, MAX_PRIORITY);
            let state = node.state.unwrap_or(if index == 0 {
                VrrpState::Leader
            } else {
                VrrpState::Backup
            });
            (priority, state)
        })
        .collect()
}

/// Pick the interface that carries the virtual IP.
///
/// A configured name must exist with an IPv4 address. Otherwise the first
/// physical interface holding a private address wins.
pub fn select_interface(
    host: &str,
    addrs: &[InterfaceAddress],
    configured: Option<&str>,
) -> Result<InterfaceAddress> {
    if let Some(name) = configured {
        return addrs
            .iter()
            .find(|a| a.interface == name)
            .cloned()
            .ok_or_else(|| ConvergeError::InterfaceWithoutAddress {
                host: host.to_string(),
                interface: name.to_string(),
            });
    }

    addrs
        .iter()
        .find(|a| {
            a.interface != "lo"
                && !VIRTUAL_INTERFACE_PREFIXES
                    .iter()
                    .any(|prefix| a.interface.starts_with(prefix))
                && a.class() == AddressClass::Private
        })
        .cloned()
        .ok_or_else(|| ConvergeError::NoPrivateInterface {
            host: host.to_string(),
        })
}

/// Virtual-IP candidates, highest first, skipping the interface's own address.
#[must_use]
pub fn vip_candidates(interface: &InterfaceAddress) -> Vec<Ipv4Addr> {
    interface
        .cidr
        .top_hosts(VIP_CANDIDATES)
        .into_iter()
        .filter(|ip| *ip != interface.ip())
        .collect()
}

/// Generate a random shared secret of [`AUTH_PASS_LENGTH`] hex characters.
#[must_use]
pub fn generate_auth_pass() -> String {
    let mut bytes = [0u8; AUTH_PASS_LENGTH / 2];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Plans a VRRP deployment, probing through the first node.
#[derive(Debug, Clone)]
pub struct VrrpPlanner<P> {
    probe: P,
    settings: VrrpSettings,
}

impl<P: HostProbe> VrrpPlanner<P> {
    /// Create a planner; `probe` must inspect the first enabled node.
    #[must_use]
    pub const fn new(probe: P, settings: VrrpSettings) -> Self {
        Self { probe, settings }
    }

    /// Get the settings.
    #[must_use]
    pub const fn settings(&self) -> &VrrpSettings {
        &self.settings
    }

    /// Compute the deployment. `Ok(None)` when VRRP is disabled or no node
    /// takes part.
    pub async fn plan(&self, nodes: &[VrrpNodeSpec]) -> Result<Option<VrrpDeployment>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        let enabled: Vec<&VrrpNodeSpec> = nodes.iter().filter(|n| n.enabled).collect();
        if enabled.is_empty() {
            tracing::info!("no node has VRRP enabled, skipping");
            return Ok(None);
        }
        let host = self.probe.target();

        let addrs = self.probe.interfaces().await?;
        let interface = select_interface(host, &addrs, self.settings.interface.as_deref())?;
        tracing::info!(
            host = %host,
            interface = %interface.interface,
            address = %interface.cidr,
            "selected VRRP interface"
        );

        let vip_cidr = match self.settings.virtual_ip {
            Some(vip) => {
                let prefix = vip.prefix.unwrap_or_else(|| interface.cidr.prefix());
                Ipv4Cidr::new(vip.addr, prefix)?
            }
            None => {
                let vip = self.find_unused_vip(&interface).await?;
                interface.cidr.with_addr(vip)
            }
        };

        let auth_pass = self
            .settings
            .auth_pass
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(generate_auth_pass);

        let nodes = assign_roles(&enabled, self.settings.base_priority)
            .into_iter()
            .zip(&enabled)
            .map(|((priority, state), node)| VrrpNodeConfig {
                hostname: node.host.clone(),
                priority,
                state,
                interface: interface.interface.clone(),
                vip_cidr,
            })
            .collect();

        tracing::info!(
            vip = %vip_cidr,
            router_id = self.settings.router_id,
            leader = %enabled[0].host,
            "planned VRRP deployment"
        );

        Ok(Some(VrrpDeployment {
            enabled: true,
            virtual_ip: vip_cidr.addr(),
            vip_cidr,
            interface: interface.interface,
            router_id: self.settings.router_id,
            auth_pass,
            instance: self.settings.instance.clone(),
            advert_int: self.settings.advert_int,
            nodes,
        }))
    }

    /// Probe candidates one at a time; the first free one wins.
    async fn find_unused_vip(&self, interface: &InterfaceAddress) -> Result<Ipv4Addr> {
        let candidates = vip_candidates(interface);
        let range = match (candidates.last(), candidates.first()) {
            (Some(low), Some(high)) => format!("{low}-{high}"),
            _ => interface.cidr.to_string(),
        };
        if candidates.is_empty() {
            return Err(ConvergeError::NoUnusedAddress { range });
        }

        self.probe.ensure_arping().await?;
        for candidate in candidates {
            match self.probe.probe_address(&interface.interface, candidate).await? {
                AddressUse::Free => {
                    tracing::info!(vip = %candidate, "found unused virtual IP");
                    return Ok(candidate);
                }
                AddressUse::InUse => {
                    tracing::debug!(candidate = %candidate, "virtual IP candidate in use");
                }
            }
        }
        Err(ConvergeError::NoUnusedAddress { range })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;
    use crate::address::ExcludedSubnets;
    use crate::probe::{OverlayProvider, OverlayStatus};

    struct LanProbe {
        addrs: Vec<InterfaceAddress>,
        in_use: HashSet<Ipv4Addr>,
        probed: Mutex<Vec<Ipv4Addr>>,
    }

    impl LanProbe {
        fn new(addrs: &[(&str, &str)], in_use: &[&str]) -> Self {
            Self {
                addrs: addrs
                    .iter()
                    .map(|(n, c)| InterfaceAddress::new(*n, c.parse().unwrap()))
                    .collect(),
                in_use: in_use.iter().map(|ip| ip.parse().unwrap()).collect(),
                probed: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostProbe for LanProbe {
        fn target(&self) -> &str {
            "node-1"
        }

        async fn interfaces(&self) -> Result<Vec<InterfaceAddress>> {
            Ok(self.addrs.clone())
        }

        async fn container_subnets(&self) -> Result<ExcludedSubnets> {
            Ok(ExcludedSubnets::none())
        }

        async fn overlay_status(&self, _provider: OverlayProvider) -> Result<Option<OverlayStatus>> {
            Ok(None)
        }

        async fn hostname(&self) -> Result<Option<String>> {
            Ok(None)
        }

        async fn ensure_arping(&self) -> Result<()> {
            Ok(())
        }

        async fn probe_address(&self, _interface: &str, ip: Ipv4Addr) -> Result<AddressUse> {
            self.probed.lock().unwrap().push(ip);
            Ok(if self.in_use.contains(&ip) {
                AddressUse::InUse
            } else {
                AddressUse::Free
            })
        }
    }

    fn three_nodes() -> Vec<VrrpNodeSpec> {
        vec![
            VrrpNodeSpec::new("n1"),
            VrrpNodeSpec::new("n2"),
            VrrpNodeSpec::new("n3"),
        ]
    }

    #[test]
    fn roles_descend_from_base() {
        let nodes = three_nodes();
        let refs: Vec<&VrrpNodeSpec> = nodes.iter().collect();
        assert_eq!(
            assign_roles(&refs, 100),
            vec![
                (100, VrrpState::Leader),
                (99, VrrpState::Backup),
                (98, VrrpState::Backup),
            ]
        );
    }

    #[test]
    fn roles_clamp_and_honour_overrides() {
        let nodes = vec![
            VrrpNodeSpec::new("a"),
            VrrpNodeSpec::new("b").with_priority(200).with_state(VrrpState::Leader),
            VrrpNodeSpec::new("c"),
        ];
        let refs: Vec<&VrrpNodeSpec> = nodes.iter().collect();
        assert_eq!(
            assign_roles(&refs, 1),
            vec![
                (1, VrrpState::Leader),
                (200, VrrpState::Leader),
                (1, VrrpState::Backup),
            ]
        );
        let refs = [&nodes[0]];
        assert_eq!(assign_roles(&refs, 255)[0].0, MAX_PRIORITY);
    }

    #[test]
    fn state_parsing() {
        assert_eq!("master".parse::<VrrpState>().unwrap(), VrrpState::Leader);
        assert_eq!("Leader".parse::<VrrpState>().unwrap(), VrrpState::Leader);
        assert_eq!("BACKUP".parse::<VrrpState>().unwrap(), VrrpState::Backup);
        assert!("standby".parse::<VrrpState>().is_err());
    }

    #[test]
    fn interface_selection_skips_virtual_links() {
        let addrs: Vec<InterfaceAddress> = [
            ("lo", "127.0.0.1/8"),
            ("docker0", "172.17.0.1/16"),
            ("wt0", "100.64.3.2/16"),
            ("ens3", "203.0.113.9/24"),
            ("ens4", "10.20.0.7/24"),
        ]
        .iter()
        .map(|(n, c)| InterfaceAddress::new(*n, c.parse().unwrap()))
        .collect();

        assert_eq!(select_interface("h", &addrs, None).unwrap().interface, "ens4");
        assert_eq!(select_interface("h", &addrs, Some("ens3")).unwrap().interface, "ens3");
        assert!(matches!(
            select_interface("h", &addrs, Some("eth9")),
            Err(ConvergeError::InterfaceWithoutAddress { .. })
        ));
        assert!(matches!(
            select_interface("h", &addrs[..4], None),
            Err(ConvergeError::NoPrivateInterface { .. })
        ));
    }

    #[test]
    fn candidates_skip_own_address() {
        let iface = InterfaceAddress::new("eth0", "192.168.1.254/24".parse().unwrap());
        let candidates = vip_candidates(&iface);
        assert_eq!(candidates.len(), 9);
        assert_eq!(candidates[0], Ipv4Addr::new(192, 168, 1, 253));
    }

    #[test]
    fn generated_secret_is_hex() {
        let pass = generate_auth_pass();
        assert_eq!(pass.len(), AUTH_PASS_LENGTH);
        assert!(pass.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn plan_three_nodes() {
        let probe = LanProbe::new(&[("eth0", "192.168.1.10/24")], &["192.168.1.254"]);
        let planner = VrrpPlanner::new(probe, VrrpSettings::default());
        let deployment = planner.plan(&three_nodes()).await.unwrap().unwrap();

        let roles: Vec<(u8, VrrpState)> = deployment
            .nodes
            .iter()
            .map(|n| (n.priority, n.state))
            .collect();
        assert_eq!(
            roles,
            vec![
                (100, VrrpState::Leader),
                (99, VrrpState::Backup),
                (98, VrrpState::Backup),
            ]
        );
        assert_eq!(deployment.virtual_ip, Ipv4Addr::new(192, 168, 1, 253));
        assert_eq!(deployment.vip_cidr.to_string(), "192.168.1.253/24");
        assert_eq!(deployment.router_id, DEFAULT_ROUTER_ID);
        assert_eq!(deployment.auth_pass.len(), AUTH_PASS_LENGTH);
        assert_eq!(deployment.leader().unwrap().hostname, "n1");
        // Probing stops at the first free candidate.
        assert_eq!(
            *planner.probe.probed.lock().unwrap(),
            vec![Ipv4Addr::new(192, 168, 1, 254), Ipv4Addr::new(192, 168, 1, 253)]
        );
    }

    #[tokio::test]
    async fn configured_vip_skips_probing() {
        let probe = LanProbe::new(&[("eth0", "10.0.0.5/16")], &[]);
        let settings = VrrpSettings {
            virtual_ip: Some("10.0.100.1".parse().unwrap()),
            auth_pass: Some("s3cr3t".into()),
            ..VrrpSettings::default()
        };
        let planner = VrrpPlanner::new(probe, settings);
        let deployment = planner.plan(&three_nodes()).await.unwrap().unwrap();

        assert_eq!(deployment.vip_cidr.to_string(), "10.0.100.1/16");
        assert_eq!(deployment.auth_pass, "s3cr3t");
        assert!(planner.probe.probed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_candidates_used() {
        let used: Vec<String> = (245..=254).map(|d| format!("192.168.1.{d}")).collect();
        let used: Vec<&str> = used.iter().map(String::as_str).collect();
        let probe = LanProbe::new(&[("eth0", "192.168.1.10/24")], &used);
        let planner = VrrpPlanner::new(probe, VrrpSettings::default());

        let err = planner.plan(&three_nodes()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no unused IP found in range 192.168.1.245-192.168.1.254"
        );
    }

    #[tokio::test]
    async fn disabled_nodes_are_skipped() {
        let probe = LanProbe::new(&[("eth0", "192.168.1.10/24")], &[]);
        let planner = VrrpPlanner::new(probe, VrrpSettings::default());
        let nodes = vec![
            VrrpNodeSpec::new("n1").disabled(),
            VrrpNodeSpec::new("n2"),
            VrrpNodeSpec::new("n3"),
        ];
        let deployment = planner.plan(&nodes).await.unwrap().unwrap();
        assert_eq!(deployment.nodes.len(), 2);
        assert_eq!(deployment.leader().unwrap().hostname, "n2");
    }

    #[tokio::test]
    async fn disabled_settings_plan_nothing() {
        let probe = LanProbe::new(&[], &[]);
        let settings = VrrpSettings {
            enabled: false,
            ..VrrpSettings::default()
        };
        let planner = VrrpPlanner::new(probe, settings);
        assert!(planner.plan(&three_nodes()).await.unwrap().is_none());

        let planner = VrrpPlanner::new(LanProbe::new(&[], &[]), VrrpSettings::default());
        let nodes = vec![VrrpNodeSpec::new("n1").disabled()];
        assert!(planner.plan(&nodes).await.unwrap().is_none());
    }
}
