//! IPv4 address classification and precedence.
//!
//! Addresses rank Overlay > Private > Other > Loopback. Overlay is the
//! carrier-grade NAT block 100.64.0.0/10 that mesh VPNs hand out; Private is
//! RFC 1918. Container bridge subnets are never selected.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, Result};

/// Precedence class of an IPv4 address. Higher is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressClass {
    /// 127.0.0.0/8.
    Loopback,
    /// Anything not covered by another class.
    Other,
    /// 10/8, 172.16/12 and 192.168/16.
    Private,
    /// 100.64.0.0/10.
    Overlay,
}

impl AddressClass {
    /// Classify an address. Total and pure.
    #[must_use]
    pub const fn of(ip: Ipv4Addr) -> Self {
        let [a, b, _, _] = ip.octets();
        match (a, b) {
            (100, 64..=127) => Self::Overlay,
            (10, _) | (172, 16..=31) | (192, 168) => Self::Private,
            (127, _) => Self::Loopback,
            _ => Self::Other,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Other => "other",
            Self::Private => "private",
            Self::Overlay => "overlay",
        }
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an address.
#[must_use]
pub const fn classify(ip: Ipv4Addr) -> AddressClass {
    AddressClass::of(ip)
}

/// An IPv4 address with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Create a CIDR, rejecting prefixes over 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(ConvergeError::invalid_address(
                format!("{addr}/{prefix}"),
                "prefix length exceeds 32",
            ));
        }
        Ok(Self { addr, prefix })
    }

    /// The address part.
    #[must_use]
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The netmask as an integer.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// The network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.addr.to_bits() & self.mask())
    }

    /// The broadcast address.
    #[must_use]
    pub const fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.addr.to_bits() | !self.mask())
    }

    /// Check if `ip` is inside this network.
    #[must_use]
    pub const fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.to_bits() & self.mask() == self.network().to_bits()
    }

    /// Another address with the same prefix.
    #[must_use]
    pub const fn with_addr(&self, addr: Ipv4Addr) -> Self {
        Self {
            addr,
            prefix: self.prefix,
        }
    }

    /// Up to `count` host addresses counting down from the top of the subnet.
    ///
    /// Starts just below the broadcast address and never reaches the
    /// network address. Networks of /31 and /32 have no such hosts.
    #[must_use]
    pub fn top_hosts(&self, count: usize) -> Vec<Ipv4Addr> {
        if self.prefix >= 31 {
            return Vec::new();
        }
        let network = self.network().to_bits();
        let first = self.broadcast().to_bits() - 1;
        (0..count as u32)
            .map_while(|offset| first.checked_sub(offset))
            .take_while(|bits| *bits > network)
            .map(Ipv4Addr::from_bits)
            .collect()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ConvergeError::invalid_address(s, "missing '/prefix'"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ConvergeError::invalid_address(s, "not an IPv4 address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ConvergeError::invalid_address(s, "prefix is not a number"))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Container bridge subnets excluded from selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedSubnets {
    subnets: Vec<Ipv4Cidr>,
}

impl ExcludedSubnets {
    /// No exclusions.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            subnets: Vec::new(),
        }
    }

    /// Parse CIDR strings; malformed ones (IPv6 included) are skipped.
    #[must_use]
    pub fn parse<I, S>(cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let subnets = cidrs
            .into_iter()
            .filter_map(|cidr| match cidr.as_ref().parse::<Ipv4Cidr>() {
                Ok(subnet) => Some(subnet),
                Err(e) => {
                    tracing::debug!(cidr = %cidr.as_ref(), error = %e, "skipping subnet");
                    None
                }
            })
            .collect();
        Self { subnets }
    }

    /// Check if `ip` falls in an excluded subnet.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.subnets.iter().any(|subnet| subnet.contains(ip))
    }

    /// The parsed subnets.
    #[must_use]
    pub fn subnets(&self) -> &[Ipv4Cidr] {
        &self.subnets
    }

    /// Check if nothing is excluded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }
}

impl FromIterator<Ipv4Cidr> for ExcludedSubnets {
    fn from_iter<T: IntoIterator<Item = Ipv4Cidr>>(iter: T) -> Self {
        Self {
            subnets: iter.into_iter().collect(),
        }
    }
}

/// An IPv4 address assigned to a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// Interface name.
    pub interface: String,
    /// Address and prefix.
    pub cidr: Ipv4Cidr,
}

impl InterfaceAddress {
    /// Create an interface address.
    #[must_use]
    pub fn new(interface: impl Into<String>, cidr: Ipv4Cidr) -> Self {
        Self {
            interface: interface.into(),
            cidr,
        }
    }

    /// The bare address.
    #[must_use]
    pub const fn ip(&self) -> Ipv4Addr {
        self.cidr.addr()
    }

    /// The address class.
    #[must_use]
    pub const fn class(&self) -> AddressClass {
        classify(self.cidr.addr())
    }
}

/// The cluster-facing address of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// The address.
    pub ip: Ipv4Addr,
    /// The address with its interface prefix.
    pub cidr: Ipv4Cidr,
}

/// Pick the best address: highest class first, enumeration order within a
/// class. Excluded addresses are never returned.
#[must_use]
pub fn select_best<I>(addrs: I, excluded: &ExcludedSubnets) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let mut best: Option<(AddressClass, Ipv4Addr)> = None;
    for ip in addrs {
        if excluded.contains(ip) {
            continue;
        }
        let class = classify(ip);
        if best.is_none_or(|(current, _)| class > current) {
            best = Some((class, ip));
        }
    }
    best.map(|(_, ip)| ip)
}

/// Like [`select_best`] but never returns a loopback address.
#[must_use]
pub fn select_routable<I>(addrs: I, excluded: &ExcludedSubnets) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    select_best(
        addrs
            .into_iter()
            .filter(|ip| classify(*ip) != AddressClass::Loopback),
        excluded,
    )
}

/// The cluster-facing address among interface addresses: Overlay first,
/// then Private. Other and Loopback addresses never qualify.
///
/// The last overlay address wins; among private addresses the first wins.
#[must_use]
pub fn select_network_info(addrs: &[InterfaceAddress], excluded: &ExcludedSubnets) -> Option<NetworkInfo> {
    let usable = |wanted: AddressClass| {
        move |a: &&InterfaceAddress| a.class() == wanted && !excluded.contains(a.ip())
    };
    addrs
        .iter()
        .rev()
        .find(usable(AddressClass::Overlay))
        .or_else(|| addrs.iter().find(usable(AddressClass::Private)))
        .map(|a| NetworkInfo {
            ip: a.ip(),
            cidr: a.cidr,
        })
}
