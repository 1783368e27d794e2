//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the fleet
//! service. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Control API listener.
    pub control: ControlConfig,

    /// Port range used when a create call names no port.
    pub ports: PortRangeConfig,

    /// Initial settings for new proxy instances.
    pub defaults: InstanceDefaults,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Control API listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum accepted request body in bytes (filter scripts, JSON maps).
    pub max_body_size: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Port probing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortRangeConfig {
    /// First candidate port (inclusive).
    pub start: u16,

    /// Last candidate port (inclusive).
    pub end: u16,

    /// Maximum engine bind attempts per create call.
    pub max_attempts: u32,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            start: 8081,
            end: 8581,
            max_attempts: 500,
        }
    }
}

/// Defaults applied to every new instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceDefaults {
    /// Upstream connect timeout in milliseconds (0 = none).
    pub connect_timeout_ms: u64,

    /// Upstream idle/read timeout in milliseconds (0 = none).
    pub idle_timeout_ms: u64,

    /// Whole-request timeout in milliseconds (0 = none).
    pub request_timeout_ms: u64,

    /// How long successful lookups stay cached, in seconds.
    pub dns_positive_ttl_secs: u64,

    /// How long failed lookups stay cached, in seconds.
    pub dns_negative_ttl_secs: u64,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            idle_timeout_ms: 60_000,
            request_timeout_ms: 0,
            dns_positive_ttl_secs: 60,
            dns_negative_ttl_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert_eq!(config.ports.start, 8081);
        assert_eq!(config.ports.end, 8581);
        assert_eq!(config.defaults.connect_timeout_ms, 60_000);
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: FleetConfig = toml::from_str(
            r#"
            [ports]
            start = 9000
            end = 9010
            "#,
        )
        .unwrap();
        assert_eq!(config.ports.start, 9000);
        assert_eq!(config.ports.max_attempts, 500);
        assert_eq!(config.control.bind_address, "0.0.0.0:8080");
    }
}
