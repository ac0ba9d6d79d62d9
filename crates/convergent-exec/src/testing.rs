//! Scripted transport fakes for tests.
//!
//! [`ScriptedConnector`] answers commands from a per-host script, counts
//! connection attempts and closes, and can inject dial failures. Commands
//! with no scripted answer exit with status 127, like a shell would for an
//! unknown program.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth::HostAuthConfig;
use crate::error::{ExecError, Result};
use crate::transport::{CommandOutput, CommandRequest, CommandRunner, Connection, Connector};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Step {
    /// Exit with the given output.
    Output(CommandOutput),
    /// Fail with a transport error.
    Fail(String),
    /// Never finish until cancelled.
    Hang,
    /// Exit 0 echoing standard input.
    EchoStdin,
}

impl Step {
    /// Exit 0 printing `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Output(CommandOutput::with_status(stdout, "", 0))
    }

    /// Exit with `status` printing `stderr`.
    #[must_use]
    pub fn exit(status: u32, stderr: impl Into<String>) -> Self {
        Self::Output(CommandOutput::with_status("", stderr, status))
    }

    /// Fail with a channel error.
    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}

#[derive(Debug, Default)]
struct Script {
    // Keyed by (host, command). The last answer repeats.
    answers: HashMap<(String, String), VecDeque<Step>>,
    connect_failures: HashMap<String, u32>,
    close_failures: Vec<String>,
    connects: HashMap<String, u32>,
    closes: HashMap<String, u32>,
    executed: Vec<(String, String)>,
}

impl Script {
    fn next(&mut self, host: &str, command: &str) -> Step {
        self.executed.push((host.to_string(), command.to_string()));
        let Some(queue) = self.answers.get_mut(&(host.to_string(), command.to_string())) else {
            return Step::exit(127, format!("sh: {command}: not found"));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_else(|| Step::exit(127, ""))
        } else {
            queue.front().cloned().unwrap_or_else(|| Step::exit(127, ""))
        }
    }
}

/// A [`Connector`] whose hosts answer from a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    connect_delay: Duration,
}

impl ScriptedConnector {
    /// Create a connector with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script(self, edit: impl FnOnce(&mut Script)) -> Self {
        edit(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `command` on `host` with `step`.
    #[must_use]
    pub fn respond(self, host: &str, command: &str, step: Step) -> Self {
        self.respond_sequence(host, command, vec![step])
    }

    /// Answer successive runs of `command` with `steps`; the last repeats.
    #[must_use]
    pub fn respond_sequence(self, host: &str, command: &str, steps: Vec<Step>) -> Self {
        self.with_script(|script| {
            script
                .answers
                .insert((host.to_string(), command.to_string()), steps.into());
        })
    }

    /// Echo standard input back for `command`.
    #[must_use]
    pub fn echo_stdin(self, host: &str, command: &str) -> Self {
        self.respond(host, command, Step::EchoStdin)
    }

    /// Fail the first `count` connection attempts to `host` with a refused dial.
    #[must_use]
    pub fn fail_connects(self, host: &str, count: u32) -> Self {
        self.with_script(|script| {
            script.connect_failures.insert(host.to_string(), count);
        })
    }

    /// Make closing `host`'s connection fail.
    #[must_use]
    pub fn fail_close(self, host: &str) -> Self {
        self.with_script(|script| script.close_failures.push(host.to_string()))
    }

    /// Delay every connection attempt.
    #[must_use]
    pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Connection attempts made to `host`.
    #[must_use]
    pub fn connect_attempts(&self, host: &str) -> u32 {
        self.lock().connects.get(host).copied().unwrap_or(0)
    }

    /// Closes performed on `host`.
    #[must_use]
    pub fn closes(&self, host: &str) -> u32 {
        self.lock().closes.get(host).copied().unwrap_or(0)
    }

    /// Every `(host, command)` executed, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<(String, String)> {
        self.lock().executed.clone()
    }

    /// Commands executed on `host`, in order.
    #[must_use]
    pub fn executed_on(&self, host: &str) -> Vec<String> {
        self.lock()
            .executed
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(
        &self,
        host: &str,
        auth: &HostAuthConfig,
        _cancel: &CancellationToken,
    ) -> Result<ScriptedConnection> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let refused = {
            let mut script = self.lock();
            *script.connects.entry(host.to_string()).or_default() += 1;
            match script.connect_failures.get_mut(host) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if refused {
            return Err(ExecError::dial(
                host,
                auth.address(host),
                &std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }

        Ok(ScriptedConnection {
            host: host.to_string(),
            script: Arc::clone(&self.script),
            execs: AtomicU32::new(0),
        })
    }
}

/// A connection produced by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedConnection {
    host: String,
    script: Arc<Mutex<Script>>,
    execs: AtomicU32,
}

impl ScriptedConnection {
    /// Commands executed on this connection.
    #[must_use]
    pub fn exec_count(&self) -> u32 {
        self.execs.load(Ordering::SeqCst)
    }
}

impl Connection for ScriptedConnection {
    async fn exec(
        &self,
        request: &CommandRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next(&self.host, request.command);

        match step {
            Step::Output(output) => Ok(output),
            Step::Fail(reason) => Err(ExecError::channel(&self.host, reason)),
            Step::EchoStdin => Ok(CommandOutput::with_status(
                String::from_utf8_lossy(request.stdin.unwrap_or_default()),
                "",
                0,
            )),
            Step::Hang => {
                cancel.cancelled().await;
                Err(ExecError::cancelled(
                    format!("exec on {}: {}", self.host, request.command),
                    1,
                ))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        *script.closes.entry(self.host.clone()).or_default() += 1;
        if script.close_failures.contains(&self.host) {
            return Err(ExecError::channel(&self.host, "close failed: broken session"));
        }
        Ok(())
    }
}

/// A [`CommandRunner`] that answers from a script without a pool.
#[derive(Debug, Clone)]
pub struct ScriptedRunner {
    target: String,
    connector: ScriptedConnector,
}

impl ScriptedRunner {
    /// A runner for `target` backed by `connector`'s script.
    #[must_use]
    pub fn new(target: impl Into<String>, connector: ScriptedConnector) -> Self {
        Self {
            target: target.into(),
            connector,
        }
    }

    /// Get the connector.
    #[must_use]
    pub const fn connector(&self) -> &ScriptedConnector {
        &self.connector
    }
}

impl CommandRunner for ScriptedRunner {
    fn target(&self) -> &str {
        &self.target
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let step = self.connector.lock().next(&self.target, command);
        match step {
            Step::Output(output) => Ok(output),
            Step::Fail(reason) => Err(ExecError::channel(&self.target, reason)),
            Step::EchoStdin => Ok(CommandOutput::with_status("", "", 0)),
            Step::Hang => std::future::pending().await,
        }
    }
}
