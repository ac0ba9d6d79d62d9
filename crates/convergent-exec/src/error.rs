//! Error types for convergent-exec.
//!
//! Every error names the host (and where relevant the operation) it came
//! from. Transient transport failures are distinguished from permanent
//! configuration failures through [`ExecError::is_transient`], which drives
//! the retry decisions made by the pool.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Substrings that mark an error message as a transient network or
/// handshake condition worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "timeout",
    "timed out",
    "temporary failure",
    "network is unreachable",
    "no route to host",
    "unable to authenticate",
    "handshake failed",
    "connection reset",
    "broken pipe",
    "disconnected",
];

/// Check whether an error message describes a transient condition.
#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Check whether an I/O error is a transient network condition.
#[must_use]
pub fn is_transient_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
    ) || is_transient_message(&error.to_string())
}

/// The error type for remote execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The pool has no authentication configuration for the host.
    #[error("no authentication config found for host {host}")]
    NoCredentials {
        /// The unknown host.
        host: String,
    },

    /// The authentication configuration is malformed.
    #[error("invalid credentials for {host}: {reason}")]
    InvalidCredentials {
        /// The host (or configuration entry) at fault.
        host: String,
        /// What is wrong.
        reason: String,
    },

    /// The private key could not be read or decoded.
    #[error("failed to load private key for {host}: {reason}")]
    InvalidKey {
        /// The host the key belongs to.
        host: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The TCP connection could not be established.
    #[error("failed to dial {host} at {addr}: {reason}")]
    Dial {
        /// The host being dialed.
        host: String,
        /// The socket address used.
        addr: String,
        /// The reason for the failure.
        reason: String,
        /// Whether a later attempt may succeed.
        transient: bool,
    },

    /// The SSH handshake or authentication failed.
    #[error("ssh handshake with {host} failed: {reason}")]
    Handshake {
        /// The remote host.
        host: String,
        /// The reason for the failure.
        reason: String,
        /// Whether a later attempt may succeed.
        transient: bool,
    },

    /// The remote host key was rejected.
    #[error("host key verification failed for {host}: {reason}")]
    HostKey {
        /// The remote host.
        host: String,
        /// The reason for the rejection.
        reason: String,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} on {host} timed out after {duration:?}")]
    Timeout {
        /// The remote host.
        host: String,
        /// The operation that timed out.
        operation: String,
        /// The deadline.
        duration: Duration,
    },

    /// A session channel failed.
    #[error("channel error on {host}: {reason}")]
    Channel {
        /// The remote host.
        host: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A command exited with a non-zero status.
    #[error("command on {host} exited with status {status}: {command}")]
    CommandFailed {
        /// The host the command ran on.
        host: String,
        /// The command line.
        command: String,
        /// The exit status (255 when the remote reported none).
        status: u32,
        /// Captured standard error.
        stderr: String,
    },

    /// The operation was cancelled by the caller.
    #[error("{operation}: context cancelled after {attempts} attempts")]
    Cancelled {
        /// The operation label.
        operation: String,
        /// Attempts made before cancellation.
        attempts: u32,
    },

    /// Every retry attempt failed.
    #[error("{operation}: failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The operation label.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// The last attempt's error.
        #[source]
        source: Box<ExecError>,
    },

    /// A local process could not be spawned or awaited.
    #[error("failed to run local command `{command}`: {source}")]
    Spawn {
        /// The command line.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// One or more connections failed to close.
    #[error("failed to close {} connection(s): {}", .failures.len(), format_failures(.failures))]
    Close {
        /// Host and error for every failed close.
        failures: Vec<(String, ExecError)>,
    },
}

fn format_failures(failures: &[(String, ExecError)]) -> String {
    failures
        .iter()
        .map(|(host, error)| format!("{host}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ExecError {
    /// Create a missing-credentials error.
    pub fn no_credentials(host: impl Into<String>) -> Self {
        Self::NoCredentials { host: host.into() }
    }

    /// Create an invalid-credentials error.
    pub fn invalid_credentials(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a dial error from an I/O error.
    pub fn dial(host: impl Into<String>, addr: impl Into<String>, error: &io::Error) -> Self {
        Self::Dial {
            host: host.into(),
            addr: addr.into(),
            reason: error.to_string(),
            transient: is_transient_io(error),
        }
    }

    /// Create a handshake error, classifying it by message.
    pub fn handshake(host: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let transient = is_transient_message(&reason);
        Self::Handshake {
            host: host.into(),
            reason,
            transient,
        }
    }

    /// Create a channel error.
    pub fn channel(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Channel {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>, attempts: u32) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            attempts,
        }
    }

    /// Create a spawn error.
    pub fn spawn(command: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            command: command.into(),
            source,
        }
    }

    /// Check if a later attempt at the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Dial { transient, .. } | Self::Handshake { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            Self::Channel { reason, .. } => is_transient_message(reason),
            _ => false,
        }
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if this is a non-zero remote exit.
    #[must_use]
    pub const fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }

    /// The host this error concerns, when it names one.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::NoCredentials { host }
            | Self::InvalidCredentials { host, .. }
            | Self::InvalidKey { host, .. }
            | Self::Dial { host, .. }
            | Self::Handshake { host, .. }
            | Self::HostKey { host, .. }
            | Self::Timeout { host, .. }
            | Self::Channel { host, .. }
            | Self::CommandFailed { host, .. } => Some(host),
            Self::RetriesExhausted { source, .. } => source.host(),
            Self::Cancelled { .. } | Self::Spawn { .. } | Self::Close { .. } => None,
        }
    }
}

/// Result type alias for execution operations.
pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_messages() {
        assert!(is_transient_message("dial tcp: Connection refused"));
        assert!(is_transient_message("ssh: handshake failed: EOF"));
        assert!(is_transient_message("No route to host"));
        assert!(!is_transient_message("permission denied (publickey)"));
    }

    #[test]
    fn transient_io_kinds() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(is_transient_io(&refused));
        assert!(!is_transient_io(&missing));
    }

    #[test]
    fn classification() {
        assert!(ExecError::handshake("a", "connection reset by peer").is_transient());
        assert!(!ExecError::handshake("a", "no common key algorithm").is_transient());
        assert!(!ExecError::no_credentials("a").is_transient());
        assert!(ExecError::cancelled("op", 1).is_cancelled());
    }

    #[test]
    fn display_names_host_and_operation() {
        let err = ExecError::no_credentials("10.0.0.5");
        assert_eq!(
            err.to_string(),
            "no authentication config found for host 10.0.0.5"
        );

        let err = ExecError::RetriesExhausted {
            operation: "ssh-connect-10.0.0.5".into(),
            attempts: 3,
            source: Box::new(ExecError::handshake("10.0.0.5", "connection reset")),
        };
        let text = err.to_string();
        assert!(text.starts_with("ssh-connect-10.0.0.5: failed after 3 attempts"));
        assert_eq!(err.host(), Some("10.0.0.5"));
    }

    #[test]
    fn close_aggregates_every_failure() {
        let err = ExecError::Close {
            failures: vec![
                ("a".into(), ExecError::channel("a", "eof")),
                ("b".into(), ExecError::channel("b", "eof")),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("failed to close 2 connection(s)"));
        assert!(text.contains("a: channel error on a"));
        assert!(text.contains("b: channel error on b"));
    }
}
