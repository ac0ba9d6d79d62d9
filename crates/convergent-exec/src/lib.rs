//! convergent-exec: pooled, retrying remote command execution
//!
//! This crate runs shell commands on many hosts at once over SSH, keeping
//! one authenticated session per host and retrying transient dial and
//! handshake failures with exponential backoff.
//!
//! # Features
//!
//! - **Retry engine** with cancellation-aware backoff and named presets
//! - **Execution pool** that opens each host's connection exactly once
//! - **Fan-out** of one command across hosts with per-host results
//! - **SSH transport** via `russh`, with `known_hosts` and trust-on-first-use
//! - **Local runner** for commands on the controlling machine
//! - **Scripted fakes** for tests (feature: `test-utils`)
//!
//! # Example
//!
//! ```ignore
//! use convergent_exec::{ExecutionPool, HostAuthConfig, SshConnector};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> convergent_exec::Result<()> {
//!     let pool = ExecutionPool::new(SshConnector::default())
//!         .with_host("10.0.0.11", HostAuthConfig::password("root", "secret"));
//!     let cancel = CancellationToken::new();
//!
//!     let results = pool.run_all(["10.0.0.11"], "systemctl is-active docker", &cancel).await;
//!     for (host, result) in &results {
//!         println!("{host}: {}", result.stdout.trim());
//!     }
//!     pool.close().await
//! }
//! ```

pub mod auth;
pub mod error;
pub mod local;
pub mod pool;
pub mod retry;
pub mod ssh;
pub mod transport;

/// Scripted transport fakes.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::{Credential, DEFAULT_PORT, HostAuthConfig};
pub use error::{ExecError, Result};
pub use local::LocalRunner;
pub use pool::{ExecutionPool, HostResult, PoolRunner, PoolStats};
pub use retry::{RetryError, RetryPolicy, retry, retry_if};
pub use ssh::{HostKeyPolicy, SshConnection, SshConnector};
pub use transport::{CommandOutput, CommandRequest, CommandRunner, Connection, Connector};
