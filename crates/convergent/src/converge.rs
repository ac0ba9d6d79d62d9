//! One convergence run over a declared cluster.

use std::collections::BTreeMap;

use convergent_exec::{Connector, ExecutionPool, SshConnector};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::{ConvergeError, Result};
use crate::probe::ShellProbe;
use crate::resolver::{NodeAddress, resolve_all};
use crate::vrrp::{VrrpDeployment, VrrpPlanner, apply_deployment};

/// What a run decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterPlan {
    /// Resolved address of every node, keyed by configured host.
    pub addresses: BTreeMap<String, NodeAddress>,
    /// VRRP deployment; `None` when VRRP is off or no node takes part.
    pub vrrp: Option<VrrpDeployment>,
}

impl ClusterPlan {
    /// Rendered keepalived configuration per VRRP node.
    #[must_use]
    pub fn rendered_configs(&self) -> Vec<(String, String)> {
        self.vrrp
            .as_ref()
            .map(VrrpDeployment::rendered_configs)
            .unwrap_or_default()
    }
}

/// A configured cluster and the pool that reaches it.
#[derive(Debug)]
pub struct ConvergenceRun<C: Connector> {
    config: ClusterConfig,
    pool: ExecutionPool<C>,
}

impl ConvergenceRun<SshConnector> {
    /// Reach the cluster over SSH.
    pub fn connect(config: ClusterConfig) -> Result<Self> {
        Self::with_connector(config, SshConnector::default())
    }
}

impl<C: Connector> ConvergenceRun<C> {
    /// Reach the cluster through `connector`.
    pub fn with_connector(config: ClusterConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let pool = ExecutionPool::with_auth(connector, config.auth_map()?);
        Ok(Self { config, pool })
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Get the pool.
    #[must_use]
    pub const fn pool(&self) -> &ExecutionPool<C> {
        &self.pool
    }

    /// Resolve node addresses and plan VRRP. Nothing is changed on the nodes
    /// apart from installing the address probe tool when a VIP is probed.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<ClusterPlan> {
        let hosts = self.config.hosts();
        tracing::info!(nodes = hosts.len(), "resolving node addresses");
        let addresses = resolve_all(&self.pool, &hosts, self.config.overlay_provider, cancel)
            .await
            .into_iter()
            .map(|(host, resolved)| resolved.map(|address| (host, address)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let specs = self.config.vrrp_specs();
        let vrrp = match specs.iter().find(|s| s.enabled) {
            Some(first) if self.config.vrrp.enabled => {
                let probe = ShellProbe::new(self.pool.runner(first.host.as_str(), cancel.clone()));
                VrrpPlanner::new(probe, self.config.vrrp_settings()?)
                    .plan(&specs)
                    .await?
            }
            _ => {
                tracing::info!("VRRP not enabled, skipping");
                None
            }
        };

        Ok(ClusterPlan { addresses, vrrp })
    }

    /// Push the plan's VRRP deployment to its nodes.
    pub async fn apply(&self, plan: &ClusterPlan, cancel: &CancellationToken) -> Result<()> {
        match &plan.vrrp {
            Some(deployment) => apply_deployment(&self.pool, deployment, cancel).await,
            None => Ok(()),
        }
    }

    /// Plan, optionally apply, then close every connection.
    ///
    /// Close failures are logged; the run's own outcome is returned.
    pub async fn run(self, apply: bool, cancel: &CancellationToken) -> Result<ClusterPlan> {
        let outcome = async {
            let plan = self.plan(cancel).await?;
            if apply {
                self.apply(&plan, cancel).await?;
            }
            Ok::<_, ConvergeError>(plan)
        }
        .await;

        if let Err(e) = self.pool.close().await {
            tracing::warn!(error = %e, "closing connections failed");
        }
        match &outcome {
            Ok(plan) => tracing::info!(
                nodes = plan.addresses.len(),
                vrrp = plan.vrrp.is_some(),
                applied = apply,
                "convergence run finished"
            ),
            Err(e) => tracing::error!(error = %e, "convergence run failed"),
        }
        outcome
    }
}
