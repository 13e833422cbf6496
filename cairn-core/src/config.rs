//! Store configuration
//!
//! Configuration is loaded from environment variables or a TOML document,
//! with defaults suitable for an embedded, writable store.

use crate::{ConfigError, Format};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Template used to lay out records when none is configured.
pub const DEFAULT_PATH_PATTERN: &str = "{type}/{path:**}/{id}";

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the directory-backed log, if one is used.
    pub root: Option<PathBuf>,
    /// Reject every write before it reaches the log driver.
    pub read_only: bool,
    /// Format new payloads are serialized with.
    pub default_format: Format,
    /// Template used to write records.
    pub main_pattern: String,
    /// Additional templates tried (in order) before the main one when
    /// parsing physical locations.
    pub override_patterns: Vec<String>,
    /// Append records produced by schema migration to the log at startup.
    pub persist_migrations: bool,
    /// Substitute `${NAME}` placeholders while decoding.
    pub substitute_placeholders: bool,
    /// Document field compared against the identifier id; `None` disables
    /// the check.
    pub identity_field: Option<String>,
    /// Capacity of each engine's change notification channel.
    pub change_channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            read_only: false,
            default_format: Format::Yaml,
            main_pattern: DEFAULT_PATH_PATTERN.to_string(),
            override_patterns: Vec::new(),
            persist_migrations: false,
            substitute_placeholders: true,
            identity_field: Some("id".to_string()),
            change_channel_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Create StoreConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CAIRN_STORE_ROOT`: Root directory of the directory-backed log
    /// - `CAIRN_READ_ONLY`: "true" or "false" (default: false)
    /// - `CAIRN_DEFAULT_FORMAT`: "json" or "yml" (default: yml)
    /// - `CAIRN_PATH_PATTERN`: Main path template (default: `{type}/{path:**}/{id}`)
    /// - `CAIRN_PATH_PATTERN_OVERRIDES`: Comma-separated override templates
    /// - `CAIRN_PERSIST_MIGRATIONS`: "true" or "false" (default: false)
    /// - `CAIRN_SUBSTITUTE_PLACEHOLDERS`: "true" or "false" (default: true)
    /// - `CAIRN_IDENTITY_FIELD`: Identity field name, empty disables (default: id)
    /// - `CAIRN_CHANGE_CHANNEL_CAPACITY`: Change channel capacity (default: 256)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            root: std::env::var("CAIRN_STORE_ROOT").ok().map(PathBuf::from),
            read_only: env_flag("CAIRN_READ_ONLY").unwrap_or(defaults.read_only),
            default_format: std::env::var("CAIRN_DEFAULT_FORMAT")
                .ok()
                .and_then(|s| Format::from_extension(&s))
                .unwrap_or(defaults.default_format),
            main_pattern: std::env::var("CAIRN_PATH_PATTERN")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.main_pattern),
            override_patterns: std::env::var("CAIRN_PATH_PATTERN_OVERRIDES")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.override_patterns),
            persist_migrations: env_flag("CAIRN_PERSIST_MIGRATIONS")
                .unwrap_or(defaults.persist_migrations),
            substitute_placeholders: env_flag("CAIRN_SUBSTITUTE_PLACEHOLDERS")
                .unwrap_or(defaults.substitute_placeholders),
            identity_field: match std::env::var("CAIRN_IDENTITY_FIELD") {
                Ok(s) if s.trim().is_empty() => None,
                Ok(s) => Some(s.trim().to_string()),
                Err(_) => defaults.identity_field,
            },
            change_channel_capacity: std::env::var("CAIRN_CHANGE_CHANNEL_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.change_channel_capacity),
        }
    }

    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Builder-style toggle for read-only mode.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Builder-style setter for the root directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - main_pattern is not blank
    /// - override patterns are not blank
    /// - change_channel_capacity > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_pattern.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "main_pattern".to_string(),
            });
        }

        if let Some(blank) = self.override_patterns.iter().position(|p| p.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: format!("override_patterns[{}]", blank),
                value: String::new(),
                reason: "override pattern must not be blank".to_string(),
            });
        }

        if self.change_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "change_channel_capacity".to_string(),
                value: "0".to_string(),
                reason: "change_channel_capacity must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.main_pattern, DEFAULT_PATH_PATTERN);
        assert_eq!(config.default_format, Format::Yaml);
        assert!(!config.read_only);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = StoreConfig::from_toml_str(
            r#"
read_only = true
default_format = "json"
override_patterns = ["legacy/{type}/{path:**}/{id}"]
"#,
        )
        .expect("parse config");
        assert!(config.read_only);
        assert_eq!(config.default_format, Format::Json);
        assert_eq!(config.override_patterns.len(), 1);
        assert_eq!(config.main_pattern, DEFAULT_PATH_PATTERN);
        assert_eq!(config.identity_field.as_deref(), Some("id"));
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = StoreConfig::from_toml_str("read_only = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_blank_pattern() {
        let config = StoreConfig {
            main_pattern: "  ".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = StoreConfig {
            change_channel_capacity: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_builders() {
        let config = StoreConfig::default()
            .with_read_only(true)
            .with_root("/var/lib/cairn");
        assert!(config.read_only);
        assert_eq!(config.root, Some(PathBuf::from("/var/lib/cairn")));
    }
}
