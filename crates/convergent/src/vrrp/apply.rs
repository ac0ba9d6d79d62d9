//! Pushing a VRRP deployment onto its nodes.

use convergent_exec::{Connector, ExecutionPool, RetryPolicy};
use tokio_util::sync::CancellationToken;

use super::keepalived::{CONFIG_PATH, HEALTH_CHECK_PATH, KeepalivedConf, health_check_script};
use super::{VrrpDeployment, VrrpNodeConfig};
use crate::error::{ConvergeError, Result};
use crate::probe::shell_quote;

/// Installs keepalived when missing.
pub const INSTALL_KEEPALIVED: &str = "command -v keepalived >/dev/null 2>&1 || \
    { if command -v apt-get >/dev/null 2>&1; then DEBIAN_FRONTEND=noninteractive apt-get install -y -qq keepalived; \
    elif command -v dnf >/dev/null 2>&1; then dnf install -y -q keepalived; \
    elif command -v yum >/dev/null 2>&1; then yum install -y -q keepalived; \
    else exit 1; fi; }";

/// Enables keepalived at boot and restarts it with the new configuration.
pub const RESTART_KEEPALIVED: &str = "systemctl enable keepalived && systemctl restart keepalived";

/// Apply `deployment` node by node, in cluster order.
///
/// Every step is idempotent, so a partial run is repaired by running again.
/// The first failing node aborts the run.
pub async fn apply_deployment<C: Connector>(
    pool: &ExecutionPool<C>,
    deployment: &VrrpDeployment,
    cancel: &CancellationToken,
) -> Result<()> {
    if !deployment.enabled {
        return Ok(());
    }
    for node in &deployment.nodes {
        apply_node(pool, deployment, node, cancel)
            .await
            .map_err(|e| ConvergeError::Apply {
                host: node.hostname.clone(),
                source: Box::new(e),
            })?;
        tracing::info!(
            host = %node.hostname,
            state = %node.state,
            priority = node.priority,
            "applied VRRP configuration"
        );
    }
    Ok(())
}

async fn apply_node<C: Connector>(
    pool: &ExecutionPool<C>,
    deployment: &VrrpDeployment,
    node: &VrrpNodeConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let host = node.hostname.as_str();

    let policy = RetryPolicy::package_manager(format!("install-keepalived-{host}"));
    pool.run_retrying(host, INSTALL_KEEPALIVED, &policy, cancel)
        .await?;

    pool.run_checked(host, "mkdir -p /etc/keepalived", cancel)
        .await?;

    let conf = KeepalivedConf::for_node(deployment, node).render();
    write_file(pool, host, CONFIG_PATH, conf.as_bytes(), "0644", cancel).await?;
    write_file(
        pool,
        host,
        HEALTH_CHECK_PATH,
        health_check_script().as_bytes(),
        "0755",
        cancel,
    )
    .await?;

    pool.run_checked(host, RESTART_KEEPALIVED, cancel).await?;
    Ok(())
}

/// Write `contents` to `path` over stdin, so secrets never appear in argv.
async fn write_file<C: Connector>(
    pool: &ExecutionPool<C>,
    host: &str,
    path: &str,
    contents: &[u8],
    mode: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = shell_quote(path);
    let command = format!("cat > {path} && chmod {mode} {path}");
    pool.run_with_input(host, &command, contents, cancel)
        .await?
        .into_checked(host, &command)?;
    tracing::debug!(host = %host, path = %path, "wrote file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use convergent_exec::HostAuthConfig;
    use convergent_exec::testing::{ScriptedConnector, Step};

    use super::*;
    use crate::vrrp::{VrrpState, generate_auth_pass};

    fn deployment(hosts: &[&str]) -> VrrpDeployment {
        let vip_cidr = "10.0.0.250/24".parse().unwrap();
        VrrpDeployment {
            enabled: true,
            virtual_ip: "10.0.0.250".parse().unwrap(),
            vip_cidr,
            interface: "eth0".into(),
            router_id: 51,
            auth_pass: generate_auth_pass(),
            instance: "VI_1".into(),
            advert_int: 1,
            nodes: hosts
                .iter()
                .enumerate()
                .map(|(i, h)| VrrpNodeConfig {
                    hostname: (*h).to_string(),
                    priority: 100 - i as u8,
                    state: if i == 0 { VrrpState::Leader } else { VrrpState::Backup },
                    interface: "eth0".into(),
                    vip_cidr,
                })
                .collect(),
        }
    }

    fn pool(connector: &ScriptedConnector, hosts: &[&str]) -> ExecutionPool<ScriptedConnector> {
        hosts.iter().fold(ExecutionPool::new(connector.clone()), |pool, h| {
            pool.with_host(*h, HostAuthConfig::password("root", "pw"))
        })
    }

    fn script_success(connector: ScriptedConnector, host: &str) -> ScriptedConnector {
        connector
            .respond(host, INSTALL_KEEPALIVED, Step::ok(""))
            .respond(host, "mkdir -p /etc/keepalived", Step::ok(""))
            .echo_stdin(
                host,
                "cat > '/etc/keepalived/keepalived.conf' && chmod 0644 '/etc/keepalived/keepalived.conf'",
            )
            .echo_stdin(
                host,
                "cat > '/etc/keepalived/check_cluster_node.sh' && chmod 0755 '/etc/keepalived/check_cluster_node.sh'",
            )
            .respond(host, RESTART_KEEPALIVED, Step::ok(""))
    }

    #[tokio::test]
    async fn applies_every_node_in_order() {
        let hosts = ["n1", "n2"];
        let connector = script_success(script_success(ScriptedConnector::new(), "n1"), "n2");
        let pool = pool(&connector, &hosts);
        let cancel = CancellationToken::new();

        apply_deployment(&pool, &deployment(&hosts), &cancel)
            .await
            .unwrap();

        let commands = connector.executed_on("n1");
        assert_eq!(commands.len(), 5);
        assert_eq!(commands[0], INSTALL_KEEPALIVED);
        assert!(commands[2].starts_with("cat > '/etc/keepalived/keepalived.conf'"));
        assert_eq!(commands[4], RESTART_KEEPALIVED);
        assert_eq!(connector.executed_on("n2").len(), 5);
    }

    #[tokio::test]
    async fn failing_node_aborts_and_is_named() {
        let connector = script_success(script_success(ScriptedConnector::new(), "n1"), "n2")
            .respond("n1", RESTART_KEEPALIVED, Step::exit(5, "unit not found"));
        let pool = pool(&connector, &["n1", "n2"]);
        let cancel = CancellationToken::new();

        let err = apply_deployment(&pool, &deployment(&["n1", "n2"]), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(&err, ConvergeError::Apply { host, .. } if host == "n1"));
        assert!(err.to_string().contains("exited with status 5"));
        assert!(connector.executed_on("n2").is_empty());
    }

    #[tokio::test]
    async fn disabled_deployment_is_noop() {
        let connector = ScriptedConnector::new();
        let pool = pool(&connector, &["n1"]);
        let mut d = deployment(&["n1"]);
        d.enabled = false;

        apply_deployment(&pool, &d, &CancellationToken::new())
            .await
            .unwrap();
        assert!(connector.executed().is_empty());
    }
}
