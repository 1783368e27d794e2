//! Error → HTTP status mapping for the control API.
//!
//! | Error                                  | Status |
//! |----------------------------------------|--------|
//! | `PortInUse`                            | 455, body `{"port": n}` |
//! | `PortsExhausted`                       | 456    |
//! | `InstanceNotFound`                     | 404    |
//! | `Validation`, `UnsupportedCharset`     | 400    |
//! | `TimedOut`                             | 408    |
//! | `InstanceRemoved`                      | 410    |
//! | `EngineStartFailure`                   | 550    |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::FleetError;

pub const PORT_IN_USE: u16 = 455;
pub const PORTS_EXHAUSTED: u16 = 456;
pub const ENGINE_START_FAILURE: u16 = 550;

impl FleetError {
    pub fn status_code(&self) -> StatusCode {
        let code = match self {
            FleetError::PortInUse(_) => PORT_IN_USE,
            FleetError::PortsExhausted { .. } => PORTS_EXHAUSTED,
            FleetError::InstanceNotFound(_) => 404,
            FleetError::Validation { .. } | FleetError::UnsupportedCharset(_) => 400,
            FleetError::TimedOut => 408,
            FleetError::InstanceRemoved => 410,
            FleetError::EngineStartFailure(_) => ENGINE_START_FAILURE,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            FleetError::PortInUse(port) => (status, Json(json!({ "port": port }))).into_response(),
            FleetError::EngineStartFailure(cause) => {
                tracing::error!(error = %cause, "Proxy engine failed to start");
                (status, self.to_string()).into_response()
            }
            _ => {
                tracing::debug!(status = status.as_u16(), error = %self, "Control request failed");
                (status, self.to_string()).into_response()
            }
        }
    }
}
