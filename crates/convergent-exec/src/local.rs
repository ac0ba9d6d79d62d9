//! Local command execution.
//!
//! [`LocalRunner`] runs `sh -c <command>` on the machine the engine runs on.
//! It backs the local address scan and anything else that inspects the
//! controller itself rather than a remote node.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, Result};
use crate::transport::{CommandOutput, CommandRunner};

/// Default timeout for local commands.
pub const DEFAULT_LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs shell commands locally with a timeout and cancellation.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    shell: String,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl LocalRunner {
    /// Create a runner bound to `cancel`.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: DEFAULT_LOCAL_TIMEOUT,
            cancel,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use another shell.
    #[must_use]
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl CommandRunner for LocalRunner {
    fn target(&self) -> &str {
        "localhost"
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::spawn(command, e))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    read_all(stdout_handle.as_mut()),
                    read_all(stderr_handle.as_mut()),
                );
                let status = status.map_err(|e| ExecError::spawn(command, e))?;
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_status: status.code().map(|code| code as u32),
                    exit_signal: exit_signal(&status),
                })
            } => result,
            () = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                Err(ExecError::Timeout {
                    host: self.target().to_string(),
                    operation: command.to_string(),
                    duration: self.timeout,
                })
            }
            () = self.cancel.cancelled() => {
                let _ = child.kill().await;
                Err(ExecError::cancelled(format!("local: {command}"), 1))
            }
        }
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(handle: Option<&mut R>) -> String {
    let mut buf = Vec::new();
    if let Some(handle) = handle {
        let _ = handle.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signal| signal.to_string())
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
