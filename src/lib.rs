//! Control plane for a fleet of intercepting HTTP proxies.
//!
//! Each instance listens on its own port and applies its own traffic policy
//! (block/allow lists, rewrites, header injection, bandwidth and latency
//! shaping, DNS remapping) while optionally recording a HAR session log.
//! The registry owns instances; the control API drives them over REST.

// Fleet management
pub mod registry;
pub mod instance;
pub mod controller;
pub mod api;

// Per-instance state
pub mod settings;
pub mod activity;
pub mod har;
pub mod dns;

// Traffic handling
pub mod engine;
pub mod filter;
pub mod traffic;
pub mod charset;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod pattern;
pub mod validate;

pub use config::FleetConfig;
pub use engine::{HttpEngine, ProxyEngine};
pub use error::{FleetError, FleetResult};
pub use instance::{LaunchSpec, ProxyInstance};
pub use lifecycle::Shutdown;
pub use registry::ProxyRegistry;
