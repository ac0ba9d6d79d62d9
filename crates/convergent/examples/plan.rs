//! Plan a cluster from a configuration file.
//!
//! Resolves every node's address and computes the VRRP deployment, then
//! prints the plan as JSON followed by each node's keepalived configuration.
//! Pass `--apply` to push the configuration to the nodes.
//!
//! Run with: `cargo run --example plan -- cluster.toml [--apply]`

use convergent::prelude::*;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig::from_env())?;

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| ConvergeError::config("usage: plan <cluster.toml|cluster.json> [--apply]"))?;
    let apply = args.any(|a| a == "--apply");

    let config = ClusterConfig::load(&path)?;
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let plan = ConvergenceRun::connect(config)?.run(apply, &cancel).await?;

    let json = serde_json::to_string_pretty(&plan)
        .map_err(|e| ConvergeError::config(format!("cannot serialise plan: {e}")))?;
    println!("{json}");
    for (host, conf) in plan.rendered_configs() {
        println!("\n# ---- {host} ----\n{conf}");
    }
    Ok(())
}
