//! Error taxonomy for the control plane.
//!
//! Every registry, controller and quiescence operation reports failures
//! through [`FleetError`]. The API layer maps each variant to a status code
//! (see `api::error`), so variants stay distinguishable: a caller hitting
//! `PortInUse` can retry without a port, one hitting `PortsExhausted` cannot.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by control-plane operations.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The requested port already belongs to a live instance.
    #[error("port {0} is already in use by another proxy instance")]
    PortInUse(u16),

    /// Every candidate port in the probe range is mapped or failed to bind.
    #[error("no free port left in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    /// No live instance on the given port.
    #[error("no proxy instance on port {0}")]
    InstanceNotFound(u16),

    /// Input rejected before any state was touched.
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The proxy engine could not be started on the chosen port.
    #[error("proxy engine failed to start: {0}")]
    EngineStartFailure(#[source] EngineError),

    /// The overall deadline of a quiescence wait passed first.
    #[error("timed out waiting for traffic to go quiet")]
    TimedOut,

    /// The instance was deleted while a caller was waiting on it.
    #[error("proxy instance was removed while waiting")]
    InstanceRemoved,

    /// A request body declared a charset we cannot decode.
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
}

impl FleetError {
    /// Shorthand for [`FleetError::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for control-plane operations.
pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::PortInUse(8081);
        assert_eq!(err.to_string(), "port 8081 is already in use by another proxy instance");

        let err = FleetError::validation("upstreamBps", "must be >= 0");
        assert_eq!(err.to_string(), "invalid upstreamBps: must be >= 0");

        let err = FleetError::PortsExhausted { start: 8081, end: 8090 };
        assert!(err.to_string().contains("8081-8090"));
    }

    #[test]
    fn test_engine_failure_keeps_cause() {
        use std::error::Error as _;

        let err = FleetError::EngineStartFailure(EngineError::AddressInUse(9000));
        let source = err.source().expect("cause should be attached");
        assert!(source.to_string().contains("9000"));
    }
}
