//! Transport traits and command types.
//!
//! A [`Connector`] turns a host and its [`HostAuthConfig`] into an
//! authenticated [`Connection`]; the pool owns one connection per host.
//! [`CommandRunner`] is the narrower capability higher layers use to run a
//! shell command on "some" machine without caring which transport backs it.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::auth::HostAuthConfig;
use crate::error::{ExecError, Result};

/// Exit status reported when the remote side sent none.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

/// A command to execute.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    /// Shell command line.
    pub command: &'a str,
    /// Bytes written to standard input before EOF.
    pub stdin: Option<&'a [u8]>,
}

impl<'a> CommandRequest<'a> {
    /// A command with no input.
    #[must_use]
    pub const fn new(command: &'a str) -> Self {
        Self {
            command,
            stdin: None,
        }
    }

    /// A command fed `stdin`.
    #[must_use]
    pub const fn with_input(command: &'a str, stdin: &'a [u8]) -> Self {
        Self {
            command,
            stdin: Some(stdin),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output as text.
    pub stdout: String,
    /// Standard error as text.
    pub stderr: String,
    /// Exit status, if reported.
    pub exit_status: Option<u32>,
    /// Terminating signal name, if reported.
    pub exit_signal: Option<String>,
}

impl CommandOutput {
    /// Output of a command that exited with `status`.
    #[must_use]
    pub fn with_status(stdout: impl Into<String>, stderr: impl Into<String>, status: u32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status: Some(status),
            exit_signal: None,
        }
    }

    /// Check if the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }

    /// Exit status, or [`UNKNOWN_EXIT_STATUS`].
    #[must_use]
    pub fn status(&self) -> u32 {
        self.exit_status.unwrap_or(UNKNOWN_EXIT_STATUS)
    }

    /// Convert a non-zero exit into [`ExecError::CommandFailed`].
    pub fn into_checked(self, host: &str, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                status: self.status(),
                stderr: self.stderr,
            })
        }
    }
}

/// An authenticated session to one host.
pub trait Connection: Send + Sync + 'static {
    /// Run a command and capture its output.
    ///
    /// Cancelling `cancel` kills the remote process and yields
    /// [`ExecError::Cancelled`].
    fn exec(
        &self,
        request: &CommandRequest<'_>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Close the session.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Creates connections.
pub trait Connector: Send + Sync {
    /// The connection type produced.
    type Connection: Connection;

    /// Dial, handshake and authenticate once.
    ///
    /// Retrying is the caller's job; implementations classify their errors
    /// through [`ExecError::is_transient`].
    fn connect(
        &self,
        host: &str,
        auth: &HostAuthConfig,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// Runs shell commands on one target machine.
pub trait CommandRunner: Send + Sync {
    /// The target name for logs and errors.
    fn target(&self) -> &str;

    /// Run `command`. A non-zero exit is data, not an error.
    fn run(&self, command: &str) -> impl Future<Output = Result<CommandOutput>> + Send;
}
