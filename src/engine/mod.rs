//! Proxy engine interface.
//!
//! # Data Flow
//! ```text
//! registry.create
//!     → ProxyEngine::start(port, launch spec, runtime)
//!     → EngineHandle (owned by the ProxyInstance)
//!
//! engine, per request
//!     → runtime.activity.begin()       (activity event, guard)
//!     → runtime.settings.load()        (one snapshot per request)
//!     → traffic::evaluate / filters / dispatch
//!     → runtime.recorder.record(entry)
//!
//! registry.delete
//!     → EngineHandle::stop (port released when this returns)
//! ```

pub mod http;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::instance::{InstanceRuntime, LaunchSpec};

pub use http::HttpEngine;

/// Why an engine could not start.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The port is taken by something outside the registry. Probing skips it.
    #[error("address already in use on port {0}")]
    AddressInUse(u16),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to build upstream client: {0}")]
    Client(String),
}

/// Starts intercepting proxies.
#[async_trait]
pub trait ProxyEngine: Send + Sync + fmt::Debug {
    /// Bind `port` and start serving. The returned handle must keep the port
    /// bound until [`EngineHandle::stop`] completes.
    async fn start(
        &self,
        port: u16,
        spec: &LaunchSpec,
        runtime: Arc<InstanceRuntime>,
    ) -> Result<Box<dyn EngineHandle>, EngineError>;
}

/// A running engine.
#[async_trait]
pub trait EngineHandle: Send + Sync + fmt::Debug {
    fn local_addr(&self) -> SocketAddr;

    /// Stop serving and release the port.
    async fn stop(&mut self);
}
