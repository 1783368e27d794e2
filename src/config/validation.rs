//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (port range ordering, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FleetConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::FleetConfig;

/// A single semantic problem in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending key, e.g. `ports.start`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed config, collecting every problem found.
pub fn validate_config(config: &FleetConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.control.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "control.bind_address",
            format!("'{}' is not a socket address", config.control.bind_address),
        ));
    }
    if config.control.max_body_size == 0 {
        errors.push(ValidationError::new("control.max_body_size", "must be > 0"));
    }

    let ports = &config.ports;
    if ports.start == 0 {
        errors.push(ValidationError::new("ports.start", "must be > 0"));
    }
    if ports.end < ports.start {
        errors.push(ValidationError::new(
            "ports.end",
            format!("{} is below ports.start ({})", ports.end, ports.start),
        ));
    }
    if ports.max_attempts == 0 {
        errors.push(ValidationError::new("ports.max_attempts", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
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
    fn test_default_config_is_valid() {
        assert!(validate_config(&FleetConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = FleetConfig::default();
        config.control.bind_address = "nowhere".into();
        config.ports.start = 9000;
        config.ports.end = 8000;
        config.ports.max_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["control.bind_address", "ports.end", "ports.max_attempts"]);
    }

    #[test]
    fn test_metrics_address_only_checked_when_enabled() {
        let mut config = FleetConfig::default();
        config.observability.metrics_address = "bad".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
