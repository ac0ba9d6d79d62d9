//! Show how this machine would be addressed by the cluster.
//!
//! Run with: `cargo run --example local_address -- [none|netbird|tailscale]`

use convergent::prelude::*;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig::from_env())?;

    let overlay: OverlayProvider = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("none")
        .parse()?;

    let runner = LocalRunner::new(CancellationToken::new());
    let resolver = AddressResolver::new(ShellProbe::new(runner), overlay);

    let address = resolver.resolve_node_address("localhost").await?;
    println!("node address: {} (from {})", address.value, address.source);

    match resolver.preferred_address().await {
        Ok(ip) => println!("preferred IP: {ip} ({})", classify(ip)),
        Err(e) => println!("preferred IP: unavailable ({e})"),
    }
    if let Some(info) = resolver.network_info().await? {
        println!("network: {}", info.cidr);
    }
    Ok(())
}
