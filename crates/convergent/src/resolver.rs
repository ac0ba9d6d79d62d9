//! Node address resolution.
//!
//! [`AddressResolver`] answers "how should the cluster reach this node?"
//! from what a [`HostProbe`] reports. The precedence is fixed: an overlay
//! network wins over everything, then private addresses, then anything else.
//! Container bridge subnets are never returned.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use convergent_exec::{Connector, ExecutionPool, PoolRunner};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::address::{ExcludedSubnets, NetworkInfo, select_best, select_network_info, select_routable};
use crate::error::{ConvergeError, Result};
use crate::probe::{HostProbe, OverlayProvider, OverlayStatus, ShellProbe};

/// Where a resolved node address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressSource {
    /// The overlay client's DNS name.
    OverlayHostname,
    /// The overlay client's address.
    OverlayIp,
    /// The system hostname.
    Hostname,
    /// The best interface address.
    Interface,
    /// The host string from the configuration.
    Configured,
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OverlayHostname => "overlay-hostname",
            Self::OverlayIp => "overlay-ip",
            Self::Hostname => "hostname",
            Self::Interface => "interface",
            Self::Configured => "configured",
        })
    }
}

/// How the cluster should address a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    /// Hostname or dotted-quad address.
    pub value: String,
    /// Which step produced it.
    pub source: AddressSource,
}

impl NodeAddress {
    fn new(value: impl Into<String>, source: AddressSource) -> Self {
        Self {
            value: value.into(),
            source,
        }
    }
}

/// Resolves addresses for one machine.
#[derive(Debug, Clone)]
pub struct AddressResolver<P> {
    probe: P,
    overlay: OverlayProvider,
}

impl<P: HostProbe> AddressResolver<P> {
    /// Create a resolver.
    #[must_use]
    pub const fn new(probe: P, overlay: OverlayProvider) -> Self {
        Self { probe, overlay }
    }

    /// Get the probe.
    #[must_use]
    pub const fn probe(&self) -> &P {
        &self.probe
    }

    /// Container bridge subnets; a failing lookup excludes nothing.
    pub async fn excluded_subnets(&self) -> Result<ExcludedSubnets> {
        fall_through(self.probe.container_subnets().await, self.probe.target(), "container subnets")
            .map(Option::unwrap_or_default)
    }

    /// Best address from the interface scan, loopback as a last resort.
    pub async fn primary_address(&self) -> Result<Ipv4Addr> {
        let excluded = self.excluded_subnets().await?;
        let addrs = self.probe.interfaces().await?;
        select_best(addrs.iter().map(|a| a.ip()), &excluded).ok_or_else(|| {
            ConvergeError::NoIpv4Address {
                target: self.probe.target().to_string(),
            }
        })
    }

    /// Overlay address if the provider reports one, otherwise
    /// [`Self::primary_address`].
    pub async fn preferred_address(&self) -> Result<Ipv4Addr> {
        if let Some(ip) = self.overlay_status().await?.and_then(|s| s.ip) {
            tracing::debug!(target_host = %self.probe.target(), ip = %ip, "using overlay address");
            return Ok(ip);
        }
        self.primary_address().await
    }

    /// The cluster-facing address and prefix: Overlay, else Private.
    pub async fn network_info(&self) -> Result<Option<NetworkInfo>> {
        let excluded = self.excluded_subnets().await?;
        let addrs = self.probe.interfaces().await?;
        Ok(select_network_info(&addrs, &excluded))
    }

    /// Resolve how the cluster should reach this node.
    ///
    /// Tries the overlay hostname, the overlay address, the system hostname
    /// and the best non-loopback interface address in that order, falling
    /// back to `configured`. Only cancellation is an error.
    pub async fn resolve_node_address(&self, configured: &str) -> Result<NodeAddress> {
        let target = self.probe.target();

        if let Some(status) = self.overlay_status().await? {
            if let Some(hostname) = status.hostname {
                return Ok(NodeAddress::new(hostname, AddressSource::OverlayHostname));
            }
            if let Some(ip) = status.ip {
                return Ok(NodeAddress::new(ip.to_string(), AddressSource::OverlayIp));
            }
        }

        if let Some(hostname) = fall_through(self.probe.hostname().await, target, "hostname")?.flatten() {
            return Ok(NodeAddress::new(hostname, AddressSource::Hostname));
        }

        let excluded = self.excluded_subnets().await?;
        if let Some(addrs) = fall_through(self.probe.interfaces().await, target, "interfaces")? {
            if let Some(ip) = select_routable(addrs.iter().map(|a| a.ip()), &excluded) {
                return Ok(NodeAddress::new(ip.to_string(), AddressSource::Interface));
            }
        }

        tracing::warn!(
            target_host = %target,
            "could not resolve node address, using configured host"
        );
        Ok(NodeAddress::new(configured, AddressSource::Configured))
    }

    async fn overlay_status(&self) -> Result<Option<OverlayStatus>> {
        let status = self.probe.overlay_status(self.overlay).await;
        Ok(fall_through(status, self.probe.target(), "overlay status")?.flatten())
    }
}

/// Keep going past a failed step unless the failure is a cancellation.
fn fall_through<T>(result: Result<T>, target: &str, step: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            tracing::debug!(target_host = %target, step, error = %e, "resolution step failed");
            Ok(None)
        }
    }
}

/// A resolver that inspects a pooled host.
#[must_use]
pub fn pooled_resolver<'a, C: Connector>(
    pool: &'a ExecutionPool<C>,
    host: &str,
    overlay: OverlayProvider,
    cancel: &CancellationToken,
) -> AddressResolver<ShellProbe<PoolRunner<'a, C>>> {
    AddressResolver::new(
        ShellProbe::new(pool.runner(host, cancel.clone())),
        overlay,
    )
}

/// Resolve every host concurrently, one unit of work per host.
pub async fn resolve_all<C, I, S>(
    pool: &ExecutionPool<C>,
    hosts: I,
    overlay: OverlayProvider,
    cancel: &CancellationToken,
) -> BTreeMap<String, Result<NodeAddress>>
where
    C: Connector,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let resolutions = hosts.into_iter().map(|host| {
        let host = host.as_ref().to_string();
        async move {
            let resolver = pooled_resolver(pool, &host, overlay, cancel);
            let resolved = resolver.resolve_node_address(&host).await;
            match &resolved {
                Ok(address) => tracing::info!(
                    host = %host,
                    address = %address.value,
                    source = %address.source,
                    "resolved node address"
                ),
                Err(e) => tracing::warn!(host = %host, error = %e, "address resolution failed"),
            }
            (host, resolved)
        }
    });
    join_all(resolutions).await.into_iter().collect()
}
