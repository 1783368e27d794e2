//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → main stops the control API
//!
//! Shutdown (shutdown.rs):
//!     trigger → listener stops accepting → in-flight requests drain → task exits
//!
//! Teardown (main):
//!     control API stopped → registry.shutdown_all() → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop control API first so no instance is created
//!   while the fleet is being torn down
//! - Engine shutdown has a timeout: the listener task is aborted when it
//!   has not drained within five seconds

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
