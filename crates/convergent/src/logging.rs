//! Structured logging setup.
//!
//! Library code only emits through `tracing` macros. A process installs the
//! subscriber once with [`init`]; tests scope one with
//! `tracing::subscriber::with_default` and [`subscriber`].

use std::fmt;
use std::str::FromStr;

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::env::{EnvConfig, vars};
use crate::error::{ConvergeError, Result};

/// Level used when neither `CONVERGENT_LOG_LEVEL` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Info;

/// Minimum severity emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Per-command detail.
    Debug,
    /// Progress.
    Info,
    /// Retries and recoverable failures.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// The filter directive.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(ConvergeError::config(format!("unknown log level '{other}'"))),
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConvergeError::config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Explicit level; `None` defers to `RUST_LOG`, then [`DEFAULT_LOG_LEVEL`].
    pub level: Option<LogLevel>,
    /// Output format.
    pub format: LogFormat,
    /// Colourise text output.
    pub ansi: bool,
}

impl LoggingConfig {
    /// Read `CONVERGENT_LOG_LEVEL` and `CONVERGENT_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_config(&EnvConfig::default())
    }

    /// Read level and format from `env`. Unparseable values are ignored.
    #[must_use]
    pub fn from_env_config(env: &EnvConfig) -> Self {
        Self {
            level: env.parse(vars::LOG_LEVEL),
            format: env.parse(vars::LOG_FORMAT).unwrap_or_default(),
            ansi: false,
        }
    }

    /// Set the level.
    #[must_use]
    pub const fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Set the format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colour.
    #[must_use]
    pub const fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.as_str()),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL.as_str())),
        }
    }
}

/// Build a subscriber writing to `writer`.
pub fn subscriber<W>(config: &LoggingConfig, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(config.ansi)
            .with_target(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt_layer)
}

/// Install the global subscriber, writing to stderr.
///
/// The first call wins; later calls return
/// [`ConvergeError::LoggingAlreadyInitialised`].
pub fn init(config: &LoggingConfig) -> Result<()> {
    subscriber(config, std::io::stderr)
        .try_init()
        .map_err(|_| ConvergeError::LoggingAlreadyInitialised)?;
    tracing::debug!(format = ?config.format, level = ?config.level, "logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn env_selects_level_and_format() {
        let env = EnvConfig::new("CONVERGENT_LOGGING_TEST")
            .with_var(vars::LOG_LEVEL, "error")
            .with_var(vars::LOG_FORMAT, "json");
        let config = LoggingConfig::from_env_config(&env);
        assert_eq!(config.level, Some(LogLevel::Error));
        assert_eq!(config.format, LogFormat::Json);

        let env = EnvConfig::new("CONVERGENT_LOGGING_TEST").with_var(vars::LOG_LEVEL, "loud");
        assert_eq!(LoggingConfig::from_env_config(&env).level, None);
    }

    #[test]
    fn json_events_carry_fields() {
        let capture = Capture::default();
        let config = LoggingConfig::default()
            .with_level(LogLevel::Info)
            .with_format(LogFormat::Json);

        tracing::subscriber::with_default(subscriber(&config, capture.clone()), || {
            tracing::info!(host = "n1", attempt = 2, "operation failed, retrying");
            tracing::debug!("filtered out");
        });

        let out = capture.contents();
        assert!(out.contains("\"host\":\"n1\""), "{out}");
        assert!(out.contains("operation failed, retrying"));
        assert!(!out.contains("filtered out"));
    }

    #[test]
    fn text_events_respect_level() {
        let capture = Capture::default();
        let config = LoggingConfig::default().with_level(LogLevel::Warn);

        tracing::subscriber::with_default(subscriber(&config, capture.clone()), || {
            tracing::warn!(host = "n2", "retrying");
            tracing::info!("progress");
        });

        let out = capture.contents();
        assert!(out.contains("WARN"));
        assert!(out.contains("host=\"n2\"") || out.contains("host=n2"));
        assert!(!out.contains("progress"));
    }

    #[test]
    fn second_init_is_reported() {
        let config = LoggingConfig::default().with_level(LogLevel::Error);
        let _ = init(&config);
        assert!(matches!(
            init(&config),
            Err(ConvergeError::LoggingAlreadyInitialised)
        ));
    }
}
