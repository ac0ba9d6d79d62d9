//! Convenient re-exports for common convergent usage.
//!
//! ```ignore
//! use convergent::prelude::*;
//! ```

// Configuration and runs
pub use crate::config::{ClusterConfig, ConfigFormat};
pub use crate::converge::{ClusterPlan, ConvergenceRun};
pub use crate::logging::{self, LogFormat, LogLevel, LoggingConfig};

// Error handling
pub use crate::error::{ConvergeError, Result};

// Addresses
pub use crate::address::{AddressClass, Ipv4Cidr, classify};
pub use crate::resolver::{AddressResolver, NodeAddress};

// Probing and VRRP
pub use crate::probe::{HostProbe, OverlayProvider, ShellProbe};
pub use crate::vrrp::{VrrpDeployment, VrrpPlanner, VrrpSettings, VrrpState};

// Execution layer
pub use convergent_exec::{ExecutionPool, HostAuthConfig, LocalRunner, RetryPolicy};
