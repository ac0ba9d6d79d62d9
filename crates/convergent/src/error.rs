//! Error types for convergent.

use std::path::PathBuf;

use convergent_exec::ExecError;
use thiserror::Error;

/// The main error type for planning and convergence.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Remote or local execution failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A CIDR or address could not be parsed.
    #[error("invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The offending text.
        input: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The host has no IPv4 address at all.
    #[error("no IPv4 address found on {target}")]
    NoIpv4Address {
        /// The machine scanned.
        target: String,
    },

    /// No usable interface with a private address was found.
    #[error("no interface with a private IPv4 address found on {host}")]
    NoPrivateInterface {
        /// The host scanned.
        host: String,
    },

    /// The named interface has no IPv4 address.
    #[error("interface {interface} on {host} has no IPv4 address")]
    InterfaceWithoutAddress {
        /// The host.
        host: String,
        /// The interface.
        interface: String,
    },

    /// Every virtual-IP candidate is in use.
    #[error("no unused IP found in range {range}")]
    NoUnusedAddress {
        /// The probed range, `low-high`.
        range: String,
    },

    /// Output of a host command could not be understood.
    #[error("unexpected output from `{command}` on {target}: {reason}")]
    Probe {
        /// The machine probed.
        target: String,
        /// The command.
        command: String,
        /// What went wrong.
        reason: String,
    },

    /// Applying the VRRP configuration to a node failed.
    #[error("failed to apply VRRP configuration on {host}: {source}")]
    Apply {
        /// The failing node.
        host: String,
        /// The underlying error.
        #[source]
        source: Box<ConvergeError>,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// A configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    ConfigIo {
        /// The file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Logging was already initialised.
    #[error("logging is already initialised")]
    LoggingAlreadyInitialised,
}

impl ConvergeError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid address error.
    pub fn invalid_address(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a probe error.
    pub fn probe(
        target: impl Into<String>,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Probe {
            target: target.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Exec(e) => e.is_cancelled(),
            Self::Apply { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Check if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::ConfigIo { .. } | Self::InvalidAddress { .. }
        )
    }
}

/// Result type alias for convergent operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;
