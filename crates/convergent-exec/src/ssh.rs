//! SSH transport built on russh.
//!
//! [`SshConnector`] dials with a connection timeout, verifies the server key
//! against `known_hosts` according to a [`HostKeyPolicy`], and authenticates
//! with the host's single credential. It makes one attempt; the pool retries
//! the transient failures.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::auth::{Credential, HostAuthConfig};
use crate::error::{ExecError, Result, is_transient_io};
use crate::transport::{CommandOutput, CommandRequest, Connection, Connector};

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How server host keys are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept only keys already present in `known_hosts`.
    KnownHosts,
    /// Accept and record unknown keys; reject changed ones.
    #[default]
    Tofu,
    /// Accept any key. Only for disposable lab hosts.
    AcceptAny,
}

/// Opens SSH connections.
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
    host_key_policy: HostKeyPolicy,
    known_hosts: PathBuf,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("host_key_policy", &self.host_key_policy)
            .field("known_hosts", &self.known_hosts)
            .finish_non_exhaustive()
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            config: Arc::new(client::Config {
                inactivity_timeout: None,
                keepalive_interval: Some(Duration::from_secs(30)),
                ..Default::default()
            }),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: default_known_hosts_path(),
        }
    }
}

impl SshConnector {
    /// Create a connector with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dial timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the host key policy.
    #[must_use]
    pub const fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Use a specific `known_hosts` file.
    #[must_use]
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = path.into();
        self
    }

    async fn dial(&self, host: &str, addr: &str, cancel: &CancellationToken) -> Result<TcpStream> {
        let dial = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr));
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(ExecError::cancelled(format!("ssh-dial-{host}"), 0)),
            outcome = dial => outcome,
        };
        match outcome {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ExecError::dial(host, addr, &e)),
            Err(_) => Err(ExecError::Dial {
                host: host.to_string(),
                addr: addr.to_string(),
                reason: format!("i/o timeout after {:?}", self.connect_timeout),
                transient: true,
            }),
        }
    }
}

impl Connector for SshConnector {
    type Connection = SshConnection;

    async fn connect(
        &self,
        host: &str,
        auth: &HostAuthConfig,
        cancel: &CancellationToken,
    ) -> Result<SshConnection> {
        // Key problems never heal, so they surface before the network does.
        let key = load_key(host, auth).await?;
        let (name, port) = auth.endpoint(host);
        let addr = format!("{name}:{port}");

        let stream = self.dial(host, &addr, cancel).await?;
        let handler = ClientHandler {
            host: name,
            port,
            policy: self.host_key_policy,
            known_hosts: self.known_hosts.clone(),
        };

        let handshake = async {
            client::connect_stream(Arc::clone(&self.config), stream, handler)
                .await
                .map_err(|e| handshake_error(host, &e))
        };
        let mut handle =
            until_cancelled(cancel, || format!("ssh-handshake-{host}"), handshake).await?;

        until_cancelled(
            cancel,
            || format!("ssh-auth-{host}"),
            authenticate(&mut handle, host, auth, key),
        )
        .await?;
        tracing::debug!(host = %host, user = %auth.username, "SSH session authenticated");

        Ok(SshConnection {
            host: host.to_string(),
            handle: Mutex::new(handle),
        })
    }
}

/// Await `fut` unless `cancel` fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    operation: impl FnOnce() -> String,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(ExecError::cancelled(operation(), 0)),
        outcome = fut => outcome,
    }
}

/// Only I/O failures and a dropped session are transient.
fn handshake_error(host: &str, error: &russh::Error) -> ExecError {
    let (reason, transient) = match error {
        russh::Error::UnknownKey => {
            return ExecError::HostKey {
                host: host.to_string(),
                reason: "server key rejected by host key policy".to_string(),
            };
        }
        russh::Error::IO(io) => (io.to_string(), is_transient_io(io)),
        russh::Error::Disconnect
        | russh::Error::HUP
        | russh::Error::ConnectionTimeout
        | russh::Error::KeepaliveTimeout
        | russh::Error::InactivityTimeout => (error.to_string(), true),
        other => (format!("key exchange rejected: {other}"), false),
    };
    ExecError::Handshake {
        host: host.to_string(),
        reason,
        transient,
    }
}

async fn load_key(host: &str, auth: &HostAuthConfig) -> Result<Option<Arc<PrivateKey>>> {
    let invalid = |reason: String| ExecError::InvalidKey {
        host: host.to_string(),
        reason,
    };

    let material = match &auth.credential {
        Credential::Password(_) => return Ok(None),
        Credential::PrivateKeyPem(pem) => pem.clone(),
        Credential::PrivateKeyFile(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| invalid(format!("failed to read {}: {e}", path.display())))?,
    };

    let passphrase = auth.passphrase.as_deref();
    let key = russh::keys::decode_secret_key(&material, passphrase).map_err(|e| {
        if passphrase.is_none() && e.to_string().to_lowercase().contains("encrypted") {
            invalid("key is encrypted but no passphrase was configured".to_string())
        } else {
            invalid(format!("failed to decode key: {e}"))
        }
    })?;
    Ok(Some(Arc::new(key)))
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &str,
    auth: &HostAuthConfig,
    key: Option<Arc<PrivateKey>>,
) -> Result<()> {
    let username = auth.username.as_str();
    let outcome = match (&auth.credential, key) {
        (Credential::Password(password), _) => {
            handle.authenticate_password(username, password.as_str()).await
        }
        (_, Some(key)) => {
            let rsa_hash = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, rsa_hash))
                .await
        }
        (_, None) => {
            return Err(ExecError::invalid_credentials(host, "key credential without key"));
        }
    };

    match outcome {
        Ok(result) if result.success() => Ok(()),
        Ok(_) => Err(ExecError::Handshake {
            host: host.to_string(),
            reason: format!(
                "unable to authenticate user {username} with {}",
                auth.credential.kind()
            ),
            transient: true,
        }),
        Err(e) => Err(handshake_error(host, &e)),
    }
}

/// An authenticated SSH session.
pub struct SshConnection {
    host: String,
    handle: Mutex<Handle<ClientHandler>>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    fn channel_error(&self, action: &str, error: &russh::Error) -> ExecError {
        ExecError::channel(&self.host, format!("{action}: {error}"))
    }
}

impl Connection for SshConnection {
    async fn exec(
        &self,
        request: &CommandRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let operation = || format!("exec on {}: {}", self.host, request.command);
        let open = async {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(|e| self.channel_error("open session", &e))
        };
        let mut channel = until_cancelled(cancel, operation, open).await?;

        let setup = async {
            channel
                .exec(true, request.command)
                .await
                .map_err(|e| self.channel_error("exec", &e))?;
            if let Some(stdin) = request.stdin {
                channel
                    .data(stdin)
                    .await
                    .map_err(|e| self.channel_error("write stdin", &e))?;
            }
            channel
                .eof()
                .await
                .map_err(|e| self.channel_error("send eof", &e))
        };
        if let Err(e) = until_cancelled(cancel, operation, setup).await {
            if e.is_cancelled() {
                let _ = channel.close().await;
            }
            return Err(e);
        }

        let finished = tokio::select! {
            output = read_output(&mut channel) => Some(output),
            () = cancel.cancelled() => None,
        };

        if let Some(output) = finished {
            return Ok(output);
        }

        tracing::debug!(host = %self.host, command = %request.command, "cancelled, killing remote command");
        if let Err(e) = channel.signal(Sig::KILL).await {
            tracing::debug!(host = %self.host, error = %e, "failed to signal remote command");
        }
        let _ = channel.close().await;
        Err(ExecError::cancelled(operation(), 1))
    }

    async fn close(&self) -> Result<()> {
        let handle = self.handle.lock().await;
        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| self.channel_error("disconnect", &e))?;
        tracing::debug!(host = %self.host, "SSH connection closed");
        Ok(())
    }
}

async fn read_output(channel: &mut russh::Channel<client::Msg>) -> CommandOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut output = CommandOutput::default();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                stderr.extend_from_slice(&data);
            }
            ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                output.exit_signal = Some(format!("{signal_name:?}"));
            }
            _ => {}
        }
    }

    output.stdout = String::from_utf8_lossy(&stdout).into_owned();
    output.stderr = String::from_utf8_lossy(&stderr).into_owned();
    output
}

/// Client handler applying the host key policy.
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: PathBuf,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        let status = lookup_known_host(&self.known_hosts, &self.host, self.port, server_public_key);
        let accepted = match (self.policy, status) {
            (HostKeyPolicy::AcceptAny, _) => {
                tracing::warn!(host = %self.host, "accepting server key without verification");
                true
            }
            (_, KnownHost::Match) => true,
            (_, KnownHost::Mismatch) => {
                tracing::error!(
                    host = %self.host,
                    path = %self.known_hosts.display(),
                    "host key mismatch, refusing connection"
                );
                false
            }
            (HostKeyPolicy::KnownHosts, KnownHost::Unknown) => {
                tracing::warn!(host = %self.host, "host not found in known_hosts");
                false
            }
            (HostKeyPolicy::Tofu, KnownHost::Unknown) => {
                learn_known_host(&self.known_hosts, &self.host, self.port, server_public_key);
                true
            }
        };
        Ok(accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownHost {
    Match,
    Mismatch,
    Unknown,
}

fn known_hosts_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn lookup_known_host(path: &std::path::Path, host: &str, port: u16, key: &PublicKey) -> KnownHost {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return KnownHost::Unknown;
    };
    let pattern = known_hosts_pattern(host, port);
    let fingerprint = key.fingerprint(HashAlg::Sha256);
    let mut seen_host = false;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(_kind), Some(data)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !hosts.split(',').any(|h| h == pattern) {
            continue;
        }
        let Ok(stored) = russh::keys::parse_public_key_base64(data) else {
            continue;
        };
        if stored.algorithm() != key.algorithm() {
            continue;
        }
        if stored.fingerprint(HashAlg::Sha256) == fingerprint {
            return KnownHost::Match;
        }
        seen_host = true;
    }

    if seen_host {
        KnownHost::Mismatch
    } else {
        KnownHost::Unknown
    }
}

fn learn_known_host(path: &std::path::Path, host: &str, port: u16, key: &PublicKey) {
    use std::io::Write;

    let Ok(openssh) = key.to_openssh() else {
        tracing::warn!(host = %host, "failed to encode server key, accepting without saving");
        return;
    };
    let key_text: Vec<&str> = openssh.split_whitespace().take(2).collect();
    let line = format!("{} {}\n", known_hosts_pattern(host, port), key_text.join(" "));

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(error = %e, "failed to create known_hosts directory");
            return;
        }
    }

    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut file) => match file.write_all(line.as_bytes()) {
            Ok(()) => tracing::info!(
                host = %host,
                path = %path.display(),
                "added host key to known_hosts"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to write known_hosts"),
        },
        Err(e) => tracing::warn!(error = %e, "failed to open known_hosts"),
    }
}

fn default_known_hosts_path() -> PathBuf {
    if let Ok(path) = std::env::var("SSH_KNOWN_HOSTS") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ssh").join("known_hosts")
}
