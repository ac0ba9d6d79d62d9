//! File-based configuration loading.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{ConvergeError, Result};

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML format.
    Toml,
    /// JSON format.
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Detect format from path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Parse config content.
pub fn parse_config<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> Result<T> {
    match format {
        ConfigFormat::Toml => toml::from_str(content)
            .map_err(|e| ConvergeError::config(format!("invalid TOML: {e}"))),
        ConfigFormat::Json => serde_json::from_str(content)
            .map_err(|e| ConvergeError::config(format!("invalid JSON: {e}"))),
    }
}

/// Load a config file, choosing the format by extension.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| {
        ConvergeError::config(format!(
            "unknown config format for {} (expected .toml or .json)",
            path.display()
        ))
    })?;
    let content = std::fs::read_to_string(path).map_err(|source| ConvergeError::ConfigIo {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content, format)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn format_detection() {
        assert_eq!(ConfigFormat::from_extension("TOML"), Some(ConfigFormat::Toml));
        assert_eq!(
            ConfigFormat::from_path(Path::new("/etc/cluster.json")),
            Some(ConfigFormat::Json)
        );
        assert_eq!(ConfigFormat::from_path(Path::new("cluster.yaml")), None);
        assert_eq!(ConfigFormat::from_path(Path::new("cluster")), None);
    }

    #[test]
    fn parse_errors_name_the_format() {
        let err = parse_config::<BTreeMap<String, String>>("= nope", ConfigFormat::Toml)
            .unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
        let err = parse_config::<BTreeMap<String, String>>("{", ConfigFormat::Json).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_file::<BTreeMap<String, String>>(Path::new(
            "/nonexistent/convergent/cluster.toml",
        ))
        .unwrap_err();
        assert!(matches!(err, ConvergeError::ConfigIo { .. }));
    }
}
