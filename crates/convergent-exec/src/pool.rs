//! Per-host connection pooling.
//!
//! [`ExecutionPool`] holds at most one live connection per host. A
//! connection is opened lazily on first use, under the remote-shell retry
//! policy, and exactly once even when many tasks ask for the same host at
//! the same time. Other hosts are never blocked by a slow dial: the map lock
//! only guards insertion of a per-host cell, and the dial itself runs on that
//! cell outside the lock.
//!
//! # Example
//!
//! ```ignore
//! use convergent_exec::{ExecutionPool, HostAuthConfig, SshConnector};
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = ExecutionPool::new(SshConnector::default())
//!     .with_host("10.0.0.11", HostAuthConfig::private_key_file("root", "/root/.ssh/id_ed25519"));
//! let cancel = CancellationToken::new();
//!
//! let output = pool.run("10.0.0.11", "uname -r", &cancel).await?;
//! let results = pool.run_all(["10.0.0.11", "10.0.0.12"], "uptime", &cancel).await;
//! pool.close().await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::auth::HostAuthConfig;
use crate::error::{ExecError, Result};
use crate::retry::{RetryPolicy, retry_if};
use crate::transport::{CommandOutput, CommandRequest, CommandRunner, Connection, Connector};

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Outcome of one host in a fan-out.
#[derive(Debug, Default)]
pub struct HostResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// The failure, if any. Non-zero exits appear as
    /// [`ExecError::CommandFailed`].
    pub error: Option<ExecError>,
}

impl HostResult {
    fn from_outcome(host: &str, command: &str, outcome: Result<CommandOutput>) -> Self {
        match outcome {
            Ok(output) if output.success() => Self {
                stdout: output.stdout,
                stderr: output.stderr,
                error: None,
            },
            Ok(output) => {
                let stdout = output.stdout.clone();
                let stderr = output.stderr.clone();
                Self {
                    stdout,
                    stderr,
                    error: output.into_checked(host, command).err(),
                }
            }
            Err(error) => Self {
                error: Some(error),
                ..Self::default()
            },
        }
    }

    /// Check if the host succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Hosts with authentication configured.
    pub hosts: usize,
    /// Hosts with a live connection.
    pub live_connections: usize,
}

/// One connection per host, created on demand.
pub struct ExecutionPool<C: Connector> {
    connector: C,
    auth: HashMap<String, HostAuthConfig>,
    connect_policy: RetryPolicy,
    connections: RwLock<HashMap<String, Slot<C::Connection>>>,
}

impl<C: Connector> std::fmt::Debug for ExecutionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("hosts", &self.auth.len())
            .field("connect_policy", &self.connect_policy)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ExecutionPool<C> {
    /// Create an empty pool.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            auth: HashMap::new(),
            connect_policy: RetryPolicy::remote_shell("ssh-connect"),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Create a pool from a host → auth map.
    #[must_use]
    pub fn with_auth(connector: C, auth: HashMap<String, HostAuthConfig>) -> Self {
        Self {
            auth,
            ..Self::new(connector)
        }
    }

    /// Register a host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, auth: HostAuthConfig) -> Self {
        self.auth.insert(host.into(), auth);
        self
    }

    /// Override the connect retry policy; the label is replaced per host.
    #[must_use]
    pub fn with_connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    /// Get the connector.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Registered hosts, sorted.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.auth.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        hosts
    }

    /// Get the connection for `host`, opening it if needed.
    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<C::Connection>> {
        let auth = self
            .auth
            .get(host)
            .ok_or_else(|| ExecError::no_credentials(host))?;
        let slot = self.slot(host);

        let connection = slot
            .get_or_try_init(|| self.open(host, auth, cancel))
            .await?;
        Ok(Arc::clone(connection))
    }

    async fn open(
        &self,
        host: &str,
        auth: &HostAuthConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<C::Connection>> {
        auth.validate(host)?;
        let policy = self
            .connect_policy
            .clone()
            .with_operation(format!("ssh-connect-{host}"));

        tracing::debug!(host = %host, user = %auth.username, "opening connection");
        let connection = retry_if(
            &policy,
            cancel,
            |_| self.connector.connect(host, auth, cancel),
            ExecError::is_transient,
        )
        .await?;
        tracing::info!(host = %host, "connection established");
        Ok(Arc::new(connection))
    }

    fn slot(&self, host: &str) -> Slot<C::Connection> {
        if let Some(slot) = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
        {
            return Arc::clone(slot);
        }

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(connections.entry(host.to_string()).or_default())
    }

    /// Run a command. A non-zero exit is returned as data.
    pub async fn run(
        &self,
        host: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.exec(host, &CommandRequest::new(command), cancel).await
    }

    /// Run a command with `stdin` written to it.
    pub async fn run_with_input(
        &self,
        host: &str,
        command: &str,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.exec(host, &CommandRequest::with_input(command, stdin), cancel)
            .await
    }

    /// Run a command, failing on a non-zero exit.
    pub async fn run_checked(
        &self,
        host: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.run(host, command, cancel)
            .await?
            .into_checked(host, command)
    }

    /// Run an idempotent command under `policy`.
    ///
    /// Non-zero exits and transient transport failures are retried.
    pub async fn run_retrying(
        &self,
        host: &str,
        command: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        retry_if(
            policy,
            cancel,
            |_| self.run_checked(host, command, cancel),
            |error: &ExecError| error.is_command_failure() || error.is_transient(),
        )
        .await
        .map_err(ExecError::from)
    }

    async fn exec(
        &self,
        host: &str,
        request: &CommandRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let connection = self.acquire(host, cancel).await?;
        tracing::debug!(host = %host, command = %request.command, "running command");
        let output = connection.exec(request, cancel).await?;
        tracing::debug!(
            host = %host,
            exit_status = ?output.exit_status,
            "command finished"
        );
        Ok(output)
    }

    /// Run `command` on every host concurrently.
    ///
    /// One host's failure never affects the others.
    pub async fn run_all<I, S>(
        &self,
        hosts: I,
        command: &str,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, HostResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let runs = hosts.into_iter().map(|host| {
            let host = host.as_ref().to_string();
            async move {
                let outcome = self.run(&host, command, cancel).await;
                if let Err(error) = &outcome {
                    tracing::warn!(host = %host, error = %error, "command failed");
                }
                let result = HostResult::from_outcome(&host, command, outcome);
                (host, result)
            }
        });
        join_all(runs).await.into_iter().collect()
    }

    /// Close and forget one host's connection.
    pub async fn remove(&self, host: &str) -> Result<()> {
        let slot = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host);
        match slot.as_ref().and_then(|slot| slot.get()) {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    /// Close every live connection.
    ///
    /// All connections are attempted; failures are aggregated.
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<(String, Slot<C::Connection>)> = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let closes = drained.iter().filter_map(|(host, slot)| {
            slot.get().map(|connection| async move {
                let outcome = connection.close().await;
                (host.clone(), outcome)
            })
        });

        let mut failures: Vec<(String, ExecError)> = join_all(closes)
            .await
            .into_iter()
            .filter_map(|(host, outcome)| outcome.err().map(|error| (host, error)))
            .collect();

        if failures.is_empty() {
            tracing::debug!(closed = drained.len(), "pool closed");
            Ok(())
        } else {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            tracing::warn!(failed = failures.len(), "pool closed with errors");
            Err(ExecError::Close { failures })
        }
    }

    /// Get pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        PoolStats {
            hosts: self.auth.len(),
            live_connections: connections.values().filter(|s| s.initialized()).count(),
        }
    }

    /// A [`CommandRunner`] bound to one host.
    #[must_use]
    pub fn runner(&self, host: impl Into<String>, cancel: CancellationToken) -> PoolRunner<'_, C> {
        PoolRunner {
            pool: self,
            host: host.into(),
            cancel,
        }
    }
}

/// Runs commands on one pooled host.
#[derive(Debug)]
pub struct PoolRunner<'a, C: Connector> {
    pool: &'a ExecutionPool<C>,
    host: String,
    cancel: CancellationToken,
}

impl<C: Connector> PoolRunner<'_, C> {
    /// Get the pool.
    #[must_use]
    pub const fn pool(&self) -> &ExecutionPool<C> {
        self.pool
    }
}

impl<C: Connector> CommandRunner for PoolRunner<'_, C> {
    fn target(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.pool.run(&self.host, command, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{ScriptedConnector, Step};

    fn pool(hosts: &[&str], connector: ScriptedConnector) -> ExecutionPool<ScriptedConnector> {
        hosts.iter().fold(
            ExecutionPool::new(connector).with_connect_policy(
                RetryPolicy::remote_shell("ssh-connect").with_initial_backoff(Duration::ZERO),
            ),
            |pool, host| pool.with_host(*host, HostAuthConfig::password("root", "pw")),
        )
    }

    #[tokio::test]
    async fn unknown_host_has_no_credentials() {
        let pool = pool(&["a"], ScriptedConnector::new());
        let err = pool
            .run("b", "true", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NoCredentials { ref host } if host == "b"));
    }

    #[tokio::test]
    async fn connection_is_reused() {
        let connector = ScriptedConnector::new().respond("a", "hostname", Step::ok("a\n"));
        let pool = pool(&["a"], connector);
        let cancel = CancellationToken::new();

        pool.run("a", "hostname", &cancel).await.unwrap();
        pool.run("a", "hostname", &cancel).await.unwrap();
        assert_eq!(pool.connector().connect_attempts("a"), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                hosts: 1,
                live_connections: 1
            }
        );
    }

    #[tokio::test]
    async fn transient_dial_failures_are_retried() {
        let connector = ScriptedConnector::new().fail_connects("a", 2);
        let pool = pool(&["a"], connector);
        pool.acquire("a", &CancellationToken::new()).await.unwrap();
        assert_eq!(pool.connector().connect_attempts("a"), 3);
    }

    #[tokio::test]
    async fn exhausted_dial_names_the_host() {
        let connector = ScriptedConnector::new().fail_connects("a", 5);
        let pool = pool(&["a"], connector);
        let err = pool
            .acquire("a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("ssh-connect-a: failed after 3 attempts"));
        assert_eq!(pool.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn run_with_input_passes_stdin() {
        let connector = ScriptedConnector::new().echo_stdin("a", "cat > /tmp/f");
        let pool = pool(&["a"], connector);
        let out = pool
            .run_with_input("a", "cat > /tmp/f", b"payload", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn non_zero_exit_is_data_unless_checked() {
        let connector = ScriptedConnector::new().respond("a", "false", Step::exit(1, "nope"));
        let pool = pool(&["a"], connector);
        let cancel = CancellationToken::new();

        let out = pool.run("a", "false", &cancel).await.unwrap();
        assert_eq!(out.exit_status, Some(1));

        let err = pool.run_checked("a", "false", &cancel).await.unwrap_err();
        assert!(err.is_command_failure());
    }

    #[tokio::test]
    async fn run_retrying_retries_non_zero_exits() {
        let connector = ScriptedConnector::new().respond_sequence(
            "a",
            "apt-get install -y keepalived",
            vec![Step::exit(100, "lock held"), Step::ok("")],
        );
        let pool = pool(&["a"], connector);
        let policy = RetryPolicy::package_manager("install").with_initial_backoff(Duration::ZERO);
        pool.run_retrying(
            "a",
            "apt-get install -y keepalived",
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn remove_closes_one_host() {
        let connector = ScriptedConnector::new();
        let pool = pool(&["a", "b"], connector);
        let cancel = CancellationToken::new();
        pool.acquire("a", &cancel).await.unwrap();
        pool.acquire("b", &cancel).await.unwrap();

        pool.remove("a").await.unwrap();
        assert_eq!(pool.stats().live_connections, 1);
        assert_eq!(pool.connector().closes("a"), 1);
        assert_eq!(pool.connector().closes("b"), 0);
    }

    #[tokio::test]
    async fn close_aggregates_errors() {
        let connector = ScriptedConnector::new().fail_close("a").fail_close("c");
        let pool = pool(&["a", "b", "c"], connector);
        let cancel = CancellationToken::new();
        for host in ["a", "b", "c"] {
            pool.acquire(host, &cancel).await.unwrap();
        }

        match pool.close().await.unwrap_err() {
            ExecError::Close { failures } => {
                let hosts: Vec<&str> = failures.iter().map(|(h, _)| h.as_str()).collect();
                assert_eq!(hosts, ["a", "c"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.connector().closes("b"), 1);
        assert_eq!(pool.stats().live_connections, 0);
    }
}
