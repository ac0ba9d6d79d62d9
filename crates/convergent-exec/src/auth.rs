//! Per-host authentication configuration.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ExecError, Result};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// The single credential used to authenticate to a host.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Private key material in PEM or OpenSSH format.
    PrivateKeyPem(String),
    /// Path to a private key file.
    PrivateKeyFile(PathBuf),
}

impl Credential {
    /// Check if this credential is key based.
    #[must_use]
    pub const fn is_key(&self) -> bool {
        matches!(self, Self::PrivateKeyPem(_) | Self::PrivateKeyFile(_))
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKeyPem(_) => "private-key",
            Self::PrivateKeyFile(_) => "private-key-file",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKeyPem(_) => f.write_str("PrivateKeyPem(<redacted>)"),
            Self::PrivateKeyFile(path) => f.debug_tuple("PrivateKeyFile").field(path).finish(),
        }
    }
}

/// How to authenticate to one host.
#[derive(Clone, PartialEq, Eq)]
pub struct HostAuthConfig {
    /// Remote user.
    pub username: String,
    /// The credential.
    pub credential: Credential,
    /// Passphrase for an encrypted private key.
    pub passphrase: Option<String>,
    /// Port used when the host does not name one.
    pub port: u16,
}

impl HostAuthConfig {
    /// Create a config with an explicit credential.
    #[must_use]
    pub fn new(username: impl Into<String>, credential: Credential) -> Self {
        Self {
            username: username.into(),
            credential,
            passphrase: None,
            port: DEFAULT_PORT,
        }
    }

    /// Password authentication.
    #[must_use]
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, Credential::Password(password.into()))
    }

    /// In-memory private key authentication.
    #[must_use]
    pub fn private_key_pem(username: impl Into<String>, pem: impl Into<String>) -> Self {
        Self::new(username, Credential::PrivateKeyPem(pem.into()))
    }

    /// Private key file authentication.
    #[must_use]
    pub fn private_key_file(username: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::new(username, Credential::PrivateKeyFile(path.as_ref().to_path_buf()))
    }

    /// Build a config from optional parts, requiring exactly one credential.
    ///
    /// `host` only labels the error.
    pub fn from_parts(
        host: &str,
        username: &str,
        password: Option<&str>,
        private_key_pem: Option<&str>,
        private_key_path: Option<&Path>,
    ) -> Result<Self> {
        if username.is_empty() {
            return Err(ExecError::invalid_credentials(host, "username is empty"));
        }

        let mut credentials = Vec::with_capacity(1);
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            credentials.push(Credential::Password(password.to_string()));
        }
        if let Some(pem) = private_key_pem.filter(|p| !p.trim().is_empty()) {
            credentials.push(Credential::PrivateKeyPem(pem.to_string()));
        }
        if let Some(path) = private_key_path.filter(|p| !p.as_os_str().is_empty()) {
            credentials.push(Credential::PrivateKeyFile(path.to_path_buf()));
        }

        match credentials.len() {
            0 => Err(ExecError::invalid_credentials(
                host,
                "no credential configured (need a password, private key, or key path)",
            )),
            1 => Ok(Self::new(username, credentials.remove(0))),
            n => Err(ExecError::invalid_credentials(
                host,
                format!("{n} credentials configured, exactly one is allowed"),
            )),
        }
    }

    /// Set the key passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Check the invariants that construction through the builders cannot.
    pub fn validate(&self, host: &str) -> Result<()> {
        if self.username.is_empty() {
            return Err(ExecError::invalid_credentials(host, "username is empty"));
        }
        if self.port == 0 {
            return Err(ExecError::invalid_credentials(host, "port must be non-zero"));
        }
        if self.passphrase.is_some() && !self.credential.is_key() {
            return Err(ExecError::invalid_credentials(
                host,
                "a passphrase only applies to key credentials",
            ));
        }
        Ok(())
    }

    /// Host name and port to dial; a port in `host` wins over [`Self::port`].
    #[must_use]
    pub fn endpoint(&self, host: &str) -> (String, u16) {
        split_host_port(host, self.port)
    }

    /// The `host:port` socket address string.
    #[must_use]
    pub fn address(&self, host: &str) -> String {
        let (name, port) = self.endpoint(host);
        format!("{name}:{port}")
    }
}

impl fmt::Debug for HostAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAuthConfig")
            .field("username", &self.username)
            .field("credential", &self.credential)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .finish()
    }
}

/// Split `host[:port]`, falling back to `default_port`.
#[must_use]
pub fn split_host_port(host: &str, default_port: u16) -> (String, u16) {
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.contains(':') {
            if let Ok(port) = port.parse() {
                return (name.to_string(), port);
            }
        }
    }
    (host.to_string(), default_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_credential() {
        let ok = HostAuthConfig::from_parts("h", "root", Some("pw"), None, None).unwrap();
        assert_eq!(ok.credential, Credential::Password("pw".into()));
        assert_eq!(ok.port, 22);

        let none = HostAuthConfig::from_parts("h", "root", None, None, None);
        assert!(matches!(none, Err(ExecError::InvalidCredentials { .. })));

        let two = HostAuthConfig::from_parts(
            "h",
            "root",
            Some("pw"),
            None,
            Some(Path::new("/root/.ssh/id_ed25519")),
        );
        assert!(two.unwrap_err().to_string().contains("exactly one"));
    }

    #[test]
    fn passphrase_requires_key() {
        let cfg = HostAuthConfig::password("root", "pw").with_passphrase("x");
        assert!(cfg.validate("h").is_err());

        let cfg = HostAuthConfig::private_key_file("root", "/k").with_passphrase("x");
        assert!(cfg.validate("h").is_ok());
    }

    #[test]
    fn address_respects_embedded_port() {
        let cfg = HostAuthConfig::password("root", "pw").with_port(2222);
        assert_eq!(cfg.address("10.0.0.1"), "10.0.0.1:2222");
        assert_eq!(cfg.address("10.0.0.1:22"), "10.0.0.1:22");
        assert_eq!(cfg.address("node-a"), "node-a:2222");
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = HostAuthConfig::password("root", "hunter2");
        let text = format!("{cfg:?}");
        assert!(!text.contains("hunter2"));
        assert!(text.contains("root"));

        let cfg = HostAuthConfig::private_key_pem("root", "-----BEGIN KEY-----").with_passphrase("s3cret");
        let text = format!("{cfg:?}");
        assert!(!text.contains("BEGIN"));
        assert!(!text.contains("s3cret"));
    }
}
