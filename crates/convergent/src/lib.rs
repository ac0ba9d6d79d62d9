//! convergent: address resolution and VRRP planning for multi-host clusters
//!
//! This crate decides how the nodes of a container cluster should address
//! each other and where a floating virtual IP should live, by inspecting the
//! nodes over SSH through [`convergent_exec`].
//!
//! # Features
//!
//! - **Address classification** with a fixed precedence: overlay, private,
//!   other, loopback
//! - **Node address resolution** that prefers overlay names and skips
//!   container bridge subnets
//! - **VRRP planning** for keepalived: interface detection, free virtual IP
//!   probing, static priorities and a generated shared secret
//! - **Convergence runs** from a TOML or JSON cluster declaration
//!
//! # Example
//!
//! ```ignore
//! use convergent::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     logging::init(&LoggingConfig::from_env())?;
//!     let config = ClusterConfig::load("cluster.toml")?;
//!     let plan = ConvergenceRun::connect(config)?
//!         .run(false, &CancellationToken::new())
//!         .await?;
//!     for (host, conf) in plan.rendered_configs() {
//!         println!("# {host}\n{conf}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod converge;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod probe;
pub mod resolver;
pub mod vrrp;

pub use address::{AddressClass, ExcludedSubnets, InterfaceAddress, Ipv4Cidr, NetworkInfo, classify};
pub use config::{ClusterConfig, ConfigFormat, NodeConfig, NodeRole};
pub use converge::{ClusterPlan, ConvergenceRun};
pub use error::{ConvergeError, Result};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use probe::{AddressUse, HostProbe, OverlayProvider, OverlayStatus, ShellProbe};
pub use resolver::{AddressResolver, AddressSource, NodeAddress, resolve_all};
pub use vrrp::{
    KeepalivedConf, VrrpDeployment, VrrpNodeConfig, VrrpNodeSpec, VrrpPlanner, VrrpSettings,
    VrrpState,
};
