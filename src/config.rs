//! Environment configuration types and defaults.
//!
//! This module defines the options an embedder can set when creating an
//! environment: the reported ABI and host versions, thread checking and the
//! default log filter.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default ABI version reported by `get_version`
pub const DEFAULT_NAPI_VERSION: u32 = 8;

/// Highest ABI version this bridge can claim
pub const MAX_NAPI_VERSION: u32 = 9;

/// Default log filter directive
pub const DEFAULT_LOG_FILTER: &str = "jsc_napi_bridge=info";

/// Host version reported by `get_node_version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
    /// Release name
    pub release: String,
}

impl Default for NodeVersion {
    fn default() -> Self {
        Self {
            major: 1,
            minor: 0,
            patch: 0,
            release: "1".to_string(),
        }
    }
}

/// Configuration for one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvConfig {
    /// ABI version reported to extensions (default: 8)
    #[serde(default = "default_napi_version")]
    pub napi_version: u32,

    /// Host version reported to extensions (default: 1.0.0)
    #[serde(default)]
    pub node_version: NodeVersion,

    /// Assert the context-owning thread at every entry point (default: true)
    #[serde(default = "default_true")]
    pub check_thread: bool,

    /// Log filter used by `logging::init_tracing`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            napi_version: DEFAULT_NAPI_VERSION,
            node_version: NodeVersion::default(),
            check_thread: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl EnvConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reported ABI version
    pub fn with_napi_version(mut self, version: u32) -> Self {
        self.napi_version = version;
        self
    }

    /// Set the reported host version
    pub fn with_node_version(mut self, version: NodeVersion) -> Self {
        self.node_version = version;
        self
    }

    /// Enable or disable the thread assertion
    pub fn with_check_thread(mut self, enable: bool) -> Self {
        self.check_thread = enable;
        self
    }

    /// Set the log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.napi_version == 0 || self.napi_version > MAX_NAPI_VERSION {
            return Err(ConfigError::InvalidValue {
                field: "napi_version".into(),
                reason: format!("must be between 1 and {}", MAX_NAPI_VERSION),
            });
        }

        if self.node_version.release.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "node_version.release".into(),
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn default_napi_version() -> u32 {
    DEFAULT_NAPI_VERSION
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EnvConfig::default();
        assert_eq!(config.napi_version, DEFAULT_NAPI_VERSION);
        assert_eq!(config.node_version.major, 1);
        assert_eq!(config.node_version.release, "1");
        assert!(config.check_thread);
    }

    #[test]
    fn test_config_builder() {
        let config = EnvConfig::new()
            .with_napi_version(6)
            .with_check_thread(false)
            .with_log_filter("debug");

        assert_eq!(config.napi_version, 6);
        assert!(!config.check_thread);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_config_validation() {
        assert!(EnvConfig::new().with_napi_version(0).validate().is_err());
        assert!(EnvConfig::new().with_napi_version(10).validate().is_err());

        let mut bad_release = EnvConfig::default();
        bad_release.node_version.release.clear();
        assert!(bad_release.validate().is_err());

        assert!(EnvConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_partial_json() {
        let config = EnvConfig::from_json_str(r#"{ "napiVersion": 4 }"#).unwrap();
        assert_eq!(config.napi_version, 4);
        assert!(config.check_thread);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_config_rejects_invalid_json_value() {
        let err = EnvConfig::from_json_str(r#"{ "napiVersion": 42 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "checkThread": false,
                 "nodeVersion": {{ "major": 18, "minor": 2, "patch": 1, "release": "node" }} }}"#
        )
        .unwrap();

        let config = EnvConfig::from_file(file.path()).unwrap();
        assert!(!config.check_thread);
        assert_eq!(config.node_version.major, 18);
        assert_eq!(config.node_version.release, "node");
    }

    #[test]
    fn test_config_serialization() {
        let config = EnvConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("napiVersion"));
        let parsed: EnvConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.napi_version, config.napi_version);
    }
}
