//! Environment-based configuration.

use std::collections::HashMap;
use std::path::PathBuf;

/// Environment configuration prefix.
pub const DEFAULT_PREFIX: &str = "CONVERGENT";

/// Environment variable reader.
///
/// Values set with [`EnvConfig::with_var`] shadow the process environment,
/// which keeps tests free of global state.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Prefix for environment variables.
    prefix: String,
    /// Values that shadow the process environment.
    overrides: HashMap<String, String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl EnvConfig {
    /// Create a new environment config reader.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: HashMap::new(),
        }
    }

    /// Shadow `name` with `value`.
    #[must_use]
    pub fn with_var(mut self, name: &str, value: impl Into<String>) -> Self {
        let var_name = self.var_name(name);
        self.overrides.insert(var_name, value.into());
        self
    }

    /// Build the full environment variable name.
    fn var_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_uppercase()
        } else {
            format!("{}_{}", self.prefix, name.to_uppercase())
        }
    }

    /// Get a string value. Empty values count as unset.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        self.overrides
            .get(&var_name)
            .cloned()
            .or_else(|| std::env::var(&var_name).ok())
            .filter(|v| !v.trim().is_empty())
    }

    /// Get a parsed value.
    #[must_use]
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Get a boolean value.
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| {
            matches!(
                v.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on" | "enabled"
            )
        })
    }
}

/// Variable names read under the prefix.
pub mod vars {
    /// Log level: debug, info, warn or error.
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    /// Log format: text or json.
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    /// Overlay provider: none, netbird or tailscale.
    pub const OVERLAY_PROVIDER: &str = "OVERLAY_PROVIDER";
    /// Cluster-wide VRRP switch.
    pub const VRRP_ENABLED: &str = "VRRP_ENABLED";
    /// VRRP interface.
    pub const VRRP_INTERFACE: &str = "VRRP_INTERFACE";
    /// VRRP virtual IP.
    pub const VRRP_VIRTUAL_IP: &str = "VRRP_VIRTUAL_IP";
}

/// Get the home directory.
#[must_use]
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Expand a leading `~/` to the home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
