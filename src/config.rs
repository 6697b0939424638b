//! Runtime configuration parsing.
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [runtime]
//! ranks = 2
//! max_message_bytes = 16777216
//!
//! [logging]
//! level = "rankcall=debug"
//! format = "json"
//! output = "stderr"
//! ```

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// World and message settings.
    pub runtime: RuntimeConfig,
    /// Subscriber settings for binaries that install one.
    pub logging: LoggingConfig,
}

/// World and message settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of ranks in an in-process world.
    pub ranks: usize,
    /// Largest message a node accepts before rejecting it.
    pub max_message_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ranks: 2,
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"info"` or `"rankcall=trace"`.
    pub level: String,
    pub format: LogFormat,
    /// `"stdout"`, `"stderr"`, or a file path to append to.
    pub output: String,
    pub timestamps: bool,
    /// Include the event target (module path).
    pub target: bool,
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            output: "stderr".to_string(),
            timestamps: true,
            target: false,
            color: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.ranks == 0 {
            return Err(ConfigError::Invalid("runtime.ranks must be at least 1".to_string()));
        }
        if self.runtime.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_message_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("Failed to read config file '{0}': {1}")]
    Io(String, #[source] std::io::Error),
    /// TOML parse error.
    #[error("Failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
    /// A value outside its allowed range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[runtime]
ranks = 4
max_message_bytes = 1024

[logging]
level = "rankcall=trace"
format = "json"
output = "stdout"
timestamps = false
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.runtime.ranks, 4);
        assert_eq!(config.runtime.max_message_bytes, 1024);
        assert_eq!(config.logging.level, "rankcall=trace");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.output, "stdout");
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.runtime.ranks, 2);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.logging.output, "stderr");
    }

    #[test]
    fn test_zero_ranks_rejected() {
        let err = Config::from_str("[runtime]\nranks = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rankcall.toml");
        std::fs::write(&path, "[runtime]\nranks = 3\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.runtime.ranks, 3);

        let missing = Config::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_, _)));
    }
}
