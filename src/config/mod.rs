//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FleetConfig (validated, immutable)
//!     → registry (port range, instance defaults), control API, observability
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; per-instance behavior changes go
//!   through the control API, not the file
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{ControlConfig, FleetConfig, InstanceDefaults, ObservabilityConfig, PortRangeConfig};
