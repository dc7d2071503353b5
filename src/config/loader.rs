//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.listener.port, 3000);
        assert_eq!(config.guard.max_concurrent, 100);
        assert_eq!(config.downloads.max_concurrent, 5);
        assert_eq!(config.rate_limit.download_max_attempts, 10);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_config(
            r#"
            environment = "production"

            [listener]
            host = "snapshots.example.com"
            port = 8443

            [streaming]
            max_bytes_per_sec = 1048576
            "#,
        )
        .unwrap();

        assert!(config.environment.is_production());
        assert_eq!(config.listener.host, "snapshots.example.com");
        assert_eq!(config.listener.max_connections, 10_000);
        assert_eq!(config.streaming.max_bytes_per_sec, 1_048_576);
        assert_eq!(config.streaming.chunk_size, 64 * 1024);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = parse_config(
            r#"
            [streaming]
            max_bytes_per_sec = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = parse_config("[listener\nport = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
