//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (rates > 0, windows > 0, ratios within 0..=1)
//! - Check that paired thresholds are ordered
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::ServerConfig;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.host.trim().is_empty() {
        errors.push(ValidationError::new("listener.host", "must not be empty"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    if config.streaming.max_bytes_per_sec == 0 {
        errors.push(ValidationError::new("streaming.max_bytes_per_sec", "must be > 0"));
    }
    if config.streaming.chunk_size == 0 {
        errors.push(ValidationError::new("streaming.chunk_size", "must be > 0"));
    }

    let guard = &config.guard;
    if guard.min_threshold > guard.max_concurrent {
        errors.push(ValidationError::new(
            "guard.min_threshold",
            format!("must not exceed guard.max_concurrent ({})", guard.max_concurrent),
        ));
    }
    if guard.threshold_growth_secs == 0 {
        errors.push(ValidationError::new("guard.threshold_growth_secs", "must be > 0"));
    }
    for (field, ratio) in [
        ("guard.timeout_ratio", guard.timeout_ratio),
        ("guard.timeout_block_ratio", guard.timeout_block_ratio),
    ] {
        if !(0.0..=1.0).contains(&ratio) {
            errors.push(ValidationError::new(field, "must be within 0..=1"));
        }
    }
    for (field, secs) in [
        ("guard.receive_timeout_secs", guard.receive_timeout_secs),
        ("guard.send_timeout_secs", guard.send_timeout_secs),
        ("guard.connection_timeout_secs", guard.connection_timeout_secs),
        ("guard.sweep_interval_secs", guard.sweep_interval_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if config.downloads.max_concurrent == 0 {
        errors.push(ValidationError::new("downloads.max_concurrent", "must be > 0"));
    }
    if config.downloads.max_duration_secs == 0 {
        errors.push(ValidationError::new("downloads.max_duration_secs", "must be > 0"));
    }

    if config.rate_limit.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.guard.min_threshold = 500;
        config.guard.timeout_ratio = 1.5;
        config.rate_limit.window_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["guard.min_threshold", "guard.timeout_ratio", "rate_limit.window_secs"]
        );
    }
}
