//! Host inspection capability.
//!
//! Everything the resolver and the VRRP planner need to know about a
//! machine goes through [`HostProbe`], one structured call per question.
//! [`ShellProbe`] answers those calls by running shell commands through any
//! [`CommandRunner`], so the same code inspects a pooled remote node or the
//! local machine.

use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;

use convergent_exec::{CommandOutput, CommandRunner};
use serde::{Deserialize, Serialize};

use crate::address::{ExcludedSubnets, InterfaceAddress, Ipv4Cidr};
use crate::error::{ConvergeError, Result};

/// Lists IPv4 addresses of interfaces that are up.
pub const LIST_ADDRESSES: &str = "ip -4 -o addr show up";
/// Lists container networks, one JSON object per line.
pub const LIST_CONTAINER_NETWORKS: &str = "docker network ls --no-trunc --format '{{json .}}'";
/// Prints the fully qualified hostname, falling back to the short one.
pub const HOSTNAME: &str = "hostname -f 2>/dev/null || hostname";
/// Installs arping when it is missing.
pub const ENSURE_ARPING: &str = "command -v arping >/dev/null 2>&1 || \
    { if command -v apt-get >/dev/null 2>&1; then DEBIAN_FRONTEND=noninteractive apt-get install -y -qq iputils-arping; \
    elif command -v dnf >/dev/null 2>&1; then dnf install -y -q iputils; \
    elif command -v yum >/dev/null 2>&1; then yum install -y -q iputils; \
    else exit 1; fi; }";

/// Overlay VPN client whose status pre-empts the interface scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayProvider {
    /// No overlay network.
    #[default]
    None,
    /// Netbird.
    Netbird,
    /// Tailscale.
    Tailscale,
}

impl OverlayProvider {
    /// The status command, if any.
    #[must_use]
    pub const fn status_command(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Netbird => Some("netbird status --json"),
            Self::Tailscale => Some("tailscale status --json"),
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Netbird => "netbird",
            Self::Tailscale => "tailscale",
        }
    }
}

impl fmt::Display for OverlayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayProvider {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "netbird" => Ok(Self::Netbird),
            "tailscale" => Ok(Self::Tailscale),
            other => Err(ConvergeError::config(format!(
                "unknown overlay provider '{other}' (expected none, netbird or tailscale)"
            ))),
        }
    }
}

/// What an overlay client reports about this machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayStatus {
    /// Overlay DNS name, without a trailing dot.
    pub hostname: Option<String>,
    /// Overlay IPv4 address.
    pub ip: Option<Ipv4Addr>,
}

/// Result of a duplicate-address probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressUse {
    /// Something answered for the address.
    InUse,
    /// Nothing answered.
    Free,
}

/// Structured questions about one machine.
pub trait HostProbe: Send + Sync {
    /// The machine name for logs and errors.
    fn target(&self) -> &str;

    /// IPv4 addresses of interfaces that are up, in enumeration order.
    fn interfaces(&self) -> impl Future<Output = Result<Vec<InterfaceAddress>>> + Send;

    /// Container bridge subnets. Absent container runtime means none.
    fn container_subnets(&self) -> impl Future<Output = Result<ExcludedSubnets>> + Send;

    /// Overlay client status; `None` when the provider is absent or silent.
    fn overlay_status(
        &self,
        provider: OverlayProvider,
    ) -> impl Future<Output = Result<Option<OverlayStatus>>> + Send;

    /// System hostname; `None` when empty or `localhost`.
    fn hostname(&self) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Make the duplicate-address probe tool available.
    fn ensure_arping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Probe whether `ip` answers on the link of `interface`.
    fn probe_address(
        &self,
        interface: &str,
        ip: Ipv4Addr,
    ) -> impl Future<Output = Result<AddressUse>> + Send;
}

/// [`HostProbe`] implemented with shell commands.
#[derive(Debug, Clone)]
pub struct ShellProbe<R> {
    runner: R,
}

impl<R: CommandRunner> ShellProbe<R> {
    /// Create a probe over `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Get the runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    async fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.runner.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ConvergeError::probe(
                self.runner.target(),
                command,
                format!("exit status {}: {}", output.status(), output.stderr.trim()),
            ))
        }
    }

    async fn inspect_network(&self, id: &str) -> Option<Vec<String>> {
        let command = format!(
            "docker network inspect --format '{{{{json .IPAM.Config}}}}' {}",
            shell_quote(id)
        );
        match self.runner.run(&command).await {
            Ok(output) if output.success() => Some(parse_ipam_subnets(&output.stdout)),
            Ok(output) => {
                tracing::debug!(
                    target_host = %self.runner.target(),
                    network = %id,
                    status = output.status(),
                    "skipping network that failed inspection"
                );
                None
            }
            Err(e) => {
                tracing::debug!(network = %id, error = %e, "skipping network that failed inspection");
                None
            }
        }
    }
}

impl<R: CommandRunner> HostProbe for ShellProbe<R> {
    fn target(&self) -> &str {
        self.runner.target()
    }

    async fn interfaces(&self) -> Result<Vec<InterfaceAddress>> {
        let output = self.run_checked(LIST_ADDRESSES).await?;
        Ok(parse_ip_addr_output(&output.stdout))
    }

    async fn container_subnets(&self) -> Result<ExcludedSubnets> {
        let output = self.runner.run(LIST_CONTAINER_NETWORKS).await?;
        if !output.success() {
            tracing::debug!(
                target_host = %self.runner.target(),
                "container runtime not available, no subnets excluded"
            );
            return Ok(ExcludedSubnets::none());
        }

        let mut cidrs = Vec::new();
        for id in parse_network_ids(&output.stdout) {
            if let Some(subnets) = self.inspect_network(&id).await {
                cidrs.extend(subnets);
            }
        }
        Ok(ExcludedSubnets::parse(cidrs))
    }

    async fn overlay_status(&self, provider: OverlayProvider) -> Result<Option<OverlayStatus>> {
        let Some(command) = provider.status_command() else {
            return Ok(None);
        };
        let output = self.runner.run(command).await?;
        if !output.success() {
            tracing::debug!(
                target_host = %self.runner.target(),
                provider = %provider,
                "overlay client not available"
            );
            return Ok(None);
        }
        let status = match provider {
            OverlayProvider::None => None,
            OverlayProvider::Netbird => parse_netbird_status(&output.stdout),
            OverlayProvider::Tailscale => parse_tailscale_status(&output.stdout),
        };
        Ok(status)
    }

    async fn hostname(&self) -> Result<Option<String>> {
        let output = self.runner.run(HOSTNAME).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(usable_hostname(&output.stdout))
    }

    async fn ensure_arping(&self) -> Result<()> {
        self.run_checked(ENSURE_ARPING).await.map(|_| ())
    }

    async fn probe_address(&self, interface: &str, ip: Ipv4Addr) -> Result<AddressUse> {
        if !is_interface_name(interface) {
            return Err(ConvergeError::config(format!(
                "invalid interface name '{interface}'"
            )));
        }
        let command = format!("arping -D -c 2 -w 3 -I {interface} {ip}");
        let output = self.runner.run(&command).await?;
        // iputils arping -D: 0 means no reply, 1 means a reply came back.
        match output.exit_status {
            Some(0) => Ok(AddressUse::Free),
            Some(1) => Ok(AddressUse::InUse),
            _ => Err(ConvergeError::probe(
                self.runner.target(),
                command,
                format!("exit status {}: {}", output.status(), output.stderr.trim()),
            )),
        }
    }
}

/// Quote a string for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@'))
}

/// Parse `ip -4 -o addr show` output.
///
/// Lines look like `2: eth0    inet 192.168.1.10/24 brd ... scope global eth0`.
/// Unparseable lines are skipped.
#[must_use]
pub fn parse_ip_addr_output(output: &str) -> Vec<InterfaceAddress> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _index = fields.next()?;
            let name = fields.next()?;
            if fields.next()? != "inet" {
                return None;
            }
            let cidr: Ipv4Cidr = fields.next()?.parse().ok()?;
            // `eth0.10@eth0` style names carry the parent after '@'.
            let name = name.split('@').next().unwrap_or(name);
            Some(InterfaceAddress::new(name, cidr))
        })
        .collect()
}

#[derive(Deserialize)]
struct NetworkListEntry {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct IpamConfig {
    #[serde(rename = "Subnet", default)]
    subnet: Option<String>,
}

fn parse_network_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<NetworkListEntry>(line) {
            Ok(entry) if !entry.id.is_empty() => Some(entry.id),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed network entry");
                None
            }
        })
        .collect()
}

fn parse_ipam_subnets(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Option<Vec<IpamConfig>>>(line).ok())
        .flatten()
        .flatten()
        .filter_map(|config| config.subnet)
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetbirdStatus {
    #[serde(default)]
    fqdn: String,
    #[serde(default)]
    netbird_ip: String,
}

#[derive(Deserialize)]
struct TailscaleStatus {
    #[serde(rename = "Self")]
    this: Option<TailscalePeer>,
}

#[derive(Deserialize)]
struct TailscalePeer {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
}

fn non_empty_name(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.');
    (!name.is_empty()).then(|| name.to_string())
}

fn parse_netbird_status(output: &str) -> Option<OverlayStatus> {
    let status: NetbirdStatus = match serde_json::from_str(output) {
        Ok(status) => status,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable netbird status");
            return None;
        }
    };
    let ip = status
        .netbird_ip
        .split('/')
        .next()
        .and_then(|ip| ip.trim().parse().ok());
    Some(OverlayStatus {
        hostname: non_empty_name(&status.fqdn),
        ip,
    })
}

fn parse_tailscale_status(output: &str) -> Option<OverlayStatus> {
    let status: TailscaleStatus = match serde_json::from_str(output) {
        Ok(status) => status,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable tailscale status");
            return None;
        }
    };
    let this = status.this?;
    let ip = this
        .tailscale_ips
        .iter()
        .find_map(|ip| ip.parse::<Ipv4Addr>().ok());
    Some(OverlayStatus {
        hostname: non_empty_name(&this.dns_name),
        ip,
    })
}

fn usable_hostname(output: &str) -> Option<String> {
    let name = output.lines().next()?.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("localhost") {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use convergent_exec::testing::{ScriptedConnector, ScriptedRunner, Step};

    use super::*;

    const IP_ADDR: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0\\       valid_lft forever preferred_lft forever
3: docker0    inet 172.17.0.1/16 brd 172.17.255.255 scope global docker0\\       valid_lft forever preferred_lft forever
4: wt0    inet 100.92.14.3/16 brd 100.92.255.255 scope global wt0\\       valid_lft forever preferred_lft forever
garbage line
";

    #[test]
    fn parses_ip_addr_lines() {
        let addrs = parse_ip_addr_output(IP_ADDR);
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[1].interface, "eth0");
        assert_eq!(addrs[1].cidr.to_string(), "192.168.1.10/24");
        assert_eq!(addrs[3].interface, "wt0");
    }

    #[test]
    fn parses_vlan_interface_names() {
        let addrs = parse_ip_addr_output("5: eth0.10@eth0    inet 10.10.0.2/24 scope global eth0.10");
        assert_eq!(addrs[0].interface, "eth0.10");
    }

    #[test]
    fn parses_network_ids_skipping_garbage() {
        let out = r#"{"ID":"abc123","Name":"bridge","Driver":"bridge"}
not json
{"Name":"no id"}
{"ID":"def456","Name":"ingress"}"#;
        assert_eq!(parse_network_ids(out), vec!["abc123", "def456"]);
    }

    #[test]
    fn parses_ipam_subnets() {
        assert_eq!(
            parse_ipam_subnets(r#"[{"Subnet":"172.17.0.0/16","Gateway":"172.17.0.1"}]"#),
            vec!["172.17.0.0/16"]
        );
        assert!(parse_ipam_subnets("null").is_empty());
        assert!(parse_ipam_subnets("[]").is_empty());
        assert_eq!(
            parse_ipam_subnets(r#"[{"Gateway":"x"},{"Subnet":"fd00::/64"}]"#),
            vec!["fd00::/64"]
        );
    }

    #[test]
    fn parses_netbird() {
        let status = parse_netbird_status(
            r#"{"fqdn":"node-a.netbird.cloud","netbirdIp":"100.92.14.3/16","management":{}}"#,
        )
        .unwrap();
        assert_eq!(status.hostname.as_deref(), Some("node-a.netbird.cloud"));
        assert_eq!(status.ip, Some(Ipv4Addr::new(100, 92, 14, 3)));
        assert!(parse_netbird_status("oops").is_none());
    }

    #[test]
    fn parses_tailscale() {
        let status = parse_tailscale_status(
            r#"{"Self":{"DNSName":"node-a.tail1234.ts.net.","TailscaleIPs":["fd7a:115c::1","100.101.102.103"]}}"#,
        )
        .unwrap();
        assert_eq!(status.hostname.as_deref(), Some("node-a.tail1234.ts.net"));
        assert_eq!(status.ip, Some(Ipv4Addr::new(100, 101, 102, 103)));

        assert!(parse_tailscale_status(r#"{"BackendState":"Stopped"}"#).is_none());
    }

    #[test]
    fn hostname_rejects_localhost() {
        assert_eq!(usable_hostname("node-a.example\n"), Some("node-a.example".into()));
        assert_eq!(usable_hostname("localhost\n"), None);
        assert_eq!(usable_hostname("\n"), None);
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn provider_names() {
        assert_eq!("Netbird".parse::<OverlayProvider>().unwrap(), OverlayProvider::Netbird);
        assert_eq!("".parse::<OverlayProvider>().unwrap(), OverlayProvider::None);
        assert!("zerotier".parse::<OverlayProvider>().is_err());
    }

    fn probe(connector: ScriptedConnector) -> ShellProbe<ScriptedRunner> {
        ShellProbe::new(ScriptedRunner::new("n1", connector))
    }

    #[tokio::test]
    async fn container_subnets_skip_failed_inspections() {
        let connector = ScriptedConnector::new()
            .respond(
                "n1",
                LIST_CONTAINER_NETWORKS,
                Step::ok("{\"ID\":\"aaa\"}\n{\"ID\":\"bbb\"}\n"),
            )
            .respond(
                "n1",
                "docker network inspect --format '{{json .IPAM.Config}}' 'aaa'",
                Step::ok("[{\"Subnet\":\"172.17.0.0/16\"}]\n"),
            )
            .respond(
                "n1",
                "docker network inspect --format '{{json .IPAM.Config}}' 'bbb'",
                Step::exit(1, "Error: No such network: bbb"),
            );
        let subnets = probe(connector).container_subnets().await.unwrap();
        assert_eq!(subnets.subnets().len(), 1);
        assert!(subnets.contains(Ipv4Addr::new(172, 17, 0, 2)));
    }

    #[tokio::test]
    async fn missing_container_runtime_excludes_nothing() {
        let subnets = probe(ScriptedConnector::new())
            .container_subnets()
            .await
            .unwrap();
        assert!(subnets.is_empty());
    }

    #[tokio::test]
    async fn arping_exit_codes() {
        let connector = ScriptedConnector::new()
            .respond("n1", "arping -D -c 2 -w 3 -I eth0 10.0.0.254", Step::exit(1, ""))
            .respond("n1", "arping -D -c 2 -w 3 -I eth0 10.0.0.253", Step::ok(""))
            .respond("n1", "arping -D -c 2 -w 3 -I eth0 10.0.0.252", Step::exit(2, "socket: Operation not permitted"));
        let probe = probe(connector);

        assert_eq!(
            probe.probe_address("eth0", Ipv4Addr::new(10, 0, 0, 254)).await.unwrap(),
            AddressUse::InUse
        );
        assert_eq!(
            probe.probe_address("eth0", Ipv4Addr::new(10, 0, 0, 253)).await.unwrap(),
            AddressUse::Free
        );
        assert!(probe.probe_address("eth0", Ipv4Addr::new(10, 0, 0, 252)).await.is_err());
        assert!(probe.probe_address("eth0; reboot", Ipv4Addr::new(10, 0, 0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn absent_overlay_is_none() {
        let status = probe(ScriptedConnector::new())
            .overlay_status(OverlayProvider::Tailscale)
            .await
            .unwrap();
        assert!(status.is_none());

        let status = probe(ScriptedConnector::new())
            .overlay_status(OverlayProvider::None)
            .await
            .unwrap();
        assert!(status.is_none());
    }
}
