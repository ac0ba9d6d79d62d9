//! keepalived configuration rendering and parsing.

use std::fmt;

use super::{VrrpDeployment, VrrpNodeConfig, VrrpState};
use crate::address::Ipv4Cidr;
use crate::error::{ConvergeError, Result};

/// Where keepalived reads its configuration.
pub const CONFIG_PATH: &str = "/etc/keepalived/keepalived.conf";
/// Where the health-check script lives.
pub const HEALTH_CHECK_PATH: &str = "/etc/keepalived/check_cluster_node.sh";
/// Name of the tracked health-check script.
pub const HEALTH_CHECK_NAME: &str = "chk_cluster_node";

const HEADER: &str = "# Keepalived configuration - Generated by convergent";

/// The keepalived configuration of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivedConf {
    /// VRRP instance name.
    pub instance: String,
    /// Initial state.
    pub state: VrrpState,
    /// Interface carrying the virtual IP.
    pub interface: String,
    /// Virtual router id.
    pub router_id: u8,
    /// Priority.
    pub priority: u8,
    /// Advertisement interval in seconds.
    pub advert_int: u8,
    /// Shared secret.
    pub auth_pass: String,
    /// Virtual IP with prefix.
    pub vip_cidr: Ipv4Cidr,
}

impl KeepalivedConf {
    /// The configuration of `node` within `deployment`.
    #[must_use]
    pub fn for_node(deployment: &VrrpDeployment, node: &VrrpNodeConfig) -> Self {
        Self {
            instance: deployment.instance.clone(),
            state: node.state,
            interface: node.interface.clone(),
            router_id: deployment.router_id,
            priority: node.priority,
            advert_int: deployment.advert_int,
            auth_pass: deployment.auth_pass.clone(),
            vip_cidr: node.vip_cidr,
        }
    }

    /// Render the configuration file.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(768);
        // Writing to a String cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let state = self.state.keepalived_keyword();
        writeln!(out, "{HEADER}")?;
        writeln!(
            out,
            "# VIP: {} | Interface: {} | Node State: {state}",
            self.vip_cidr, self.interface
        )?;
        writeln!(out)?;
        writeln!(out, "global_defs {{")?;
        writeln!(out, "    router_id {}_{}", self.instance, self.router_id)?;
        writeln!(out, "    script_user root")?;
        writeln!(out, "    enable_script_security")?;
        writeln!(out, "}}\n")?;
        writeln!(out, "vrrp_script {HEALTH_CHECK_NAME} {{")?;
        writeln!(out, "    script \"{HEALTH_CHECK_PATH}\"")?;
        writeln!(out, "    interval 5")?;
        writeln!(out, "    weight -20")?;
        writeln!(out, "    fall 2")?;
        writeln!(out, "    rise 2")?;
        writeln!(out, "}}\n")?;
        writeln!(out, "vrrp_instance {} {{", self.instance)?;
        writeln!(out, "    state {state}")?;
        writeln!(out, "    interface {}", self.interface)?;
        writeln!(out, "    virtual_router_id {}", self.router_id)?;
        writeln!(out, "    priority {}", self.priority)?;
        writeln!(out, "    advert_int {}\n", self.advert_int)?;
        writeln!(out, "    authentication {{")?;
        writeln!(out, "        auth_type PASS")?;
        writeln!(out, "        auth_pass {}", self.auth_pass)?;
        writeln!(out, "    }}\n")?;
        writeln!(out, "    virtual_ipaddress {{")?;
        writeln!(out, "        {}", self.vip_cidr)?;
        writeln!(out, "    }}\n")?;
        writeln!(out, "    track_script {{")?;
        writeln!(out, "        {HEALTH_CHECK_NAME}")?;
        writeln!(out, "    }}")?;
        writeln!(out, "}}")
    }

    /// Recover a configuration from rendered text.
    ///
    /// Only the `vrrp_instance` block is authoritative; comments are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut instance = None;
        let mut state = None;
        let mut interface = None;
        let mut router_id = None;
        let mut priority = None;
        let mut advert_int = None;
        let mut auth_pass = None;
        let mut vip_cidr = None;

        let mut block: Vec<&str> = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "}" {
                block.pop();
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(key) = words.next() else { continue };
            let value = words.next();

            if line.ends_with('{') {
                if key == "vrrp_instance" {
                    instance = value.map(str::to_string);
                }
                block.push(key);
                continue;
            }

            match (block.as_slice(), key, value) {
                (["vrrp_instance"], "state", Some(v)) => state = Some(v.parse()?),
                (["vrrp_instance"], "interface", Some(v)) => interface = Some(v.to_string()),
                (["vrrp_instance"], "virtual_router_id", Some(v)) => {
                    router_id = Some(parse_number("virtual_router_id", v)?);
                }
                (["vrrp_instance"], "priority", Some(v)) => {
                    priority = Some(parse_number("priority", v)?);
                }
                (["vrrp_instance"], "advert_int", Some(v)) => {
                    advert_int = Some(parse_number("advert_int", v)?);
                }
                (["vrrp_instance", "authentication"], "auth_pass", Some(v)) => {
                    auth_pass = Some(v.to_string());
                }
                (["vrrp_instance", "virtual_ipaddress"], cidr, None) if vip_cidr.is_none() => {
                    vip_cidr = Some(cidr.parse()?);
                }
                _ => {}
            }
        }

        Ok(Self {
            instance: required(instance, "vrrp_instance")?,
            state: required(state, "state")?,
            interface: required(interface, "interface")?,
            router_id: required(router_id, "virtual_router_id")?,
            priority: required(priority, "priority")?,
            advert_int: required(advert_int, "advert_int")?,
            auth_pass: required(auth_pass, "auth_pass")?,
            vip_cidr: required(vip_cidr, "virtual_ipaddress")?,
        })
    }
}

fn parse_number(key: &str, value: &str) -> Result<u8> {
    value
        .parse()
        .map_err(|_| ConvergeError::config(format!("keepalived {key} '{value}' is not a number")))
}

fn required<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| ConvergeError::config(format!("keepalived configuration lacks {key}")))
}

/// The health-check script: healthy while the local node is a working
/// cluster member.
#[must_use]
pub const fn health_check_script() -> &'static str {
    "#!/bin/sh\n\
     # Health check - Generated by convergent\n\
     if docker node ls >/dev/null 2>&1; then\n\
     \x20   exit 0\n\
     fi\n\
     exit 1\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> KeepalivedConf {
        KeepalivedConf {
            instance: "VI_1".into(),
            state: VrrpState::Leader,
            interface: "eth0".into(),
            router_id: 51,
            priority: 100,
            advert_int: 1,
            auth_pass: "a1b2c3d4".into(),
            vip_cidr: "192.168.1.253/24".parse().unwrap(),
        }
    }

    #[test]
    fn render_is_exact() {
        let expected = "\
# Keepalived configuration - Generated by convergent
# VIP: 192.168.1.253/24 | Interface: eth0 | Node State: MASTER

global_defs {
    router_id VI_1_51
    script_user root
    enable_script_security
}

vrrp_script chk_cluster_node {
    script \"/etc/keepalived/check_cluster_node.sh\"
    interval 5
    weight -20
    fall 2
    rise 2
}

vrrp_instance VI_1 {
    state MASTER
    interface eth0
    virtual_router_id 51
    priority 100
    advert_int 1

    authentication {
        auth_type PASS
        auth_pass a1b2c3d4
    }

    virtual_ipaddress {
        192.168.1.253/24
    }

    track_script {
        chk_cluster_node
    }
}
";
        assert_eq!(conf().render(), expected);
    }

    #[test]
    fn backup_renders_backup_keyword() {
        let mut c = conf();
        c.state = VrrpState::Backup;
        let text = c.render();
        assert!(text.contains("    state BACKUP\n"));
        assert!(text.contains("Node State: BACKUP"));
    }

    #[test]
    fn parse_recovers_fields() {
        let mut c = conf();
        c.state = VrrpState::Backup;
        c.priority = 98;
        assert_eq!(KeepalivedConf::parse(&c.render()).unwrap(), c);
    }

    #[test]
    fn parse_rejects_incomplete_text() {
        let text = "vrrp_instance VI_1 {\n    state MASTER\n}\n";
        let err = KeepalivedConf::parse(text).unwrap_err();
        assert!(err.to_string().contains("lacks interface"));
    }

    #[test]
    fn health_script_checks_swarm() {
        let script = health_check_script();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("    exit 0\n"));
        assert!(script.contains("docker node ls"));
    }
}
