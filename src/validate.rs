//! Input validation shared by the controller and the control API.
//!
//! Every helper here fails with [`FleetError::Validation`] and never touches
//! instance state, so callers can validate a whole request before applying
//! any of it.

use axum::http::{HeaderName, HeaderValue};

use crate::error::{FleetError, FleetResult};

/// Status used when a rule's status code is missing or unparsable.
pub const DEFAULT_RULE_STATUS: u16 = 200;

/// Parse a non-negative integer, rejecting negatives and garbage alike.
pub fn parse_non_negative(field: &str, raw: &str) -> FleetResult<u64> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| FleetError::validation(field, format!("'{}' is not an integer", raw)))?;
    u64::try_from(value).map_err(|_| FleetError::validation(field, "must be >= 0"))
}

/// Parse an optional non-negative integer parameter.
pub fn parse_optional(field: &str, raw: Option<&String>) -> FleetResult<Option<u64>> {
    raw.map(|value| parse_non_negative(field, value)).transpose()
}

/// Parse a rule status code, falling back to 200 when absent or unparsable.
pub fn parse_status(raw: Option<&str>) -> u16 {
    raw.and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|code| (100..=999).contains(code))
        .unwrap_or(DEFAULT_RULE_STATUS)
}

/// Parse a listening port.
pub fn parse_port(field: &str, raw: &str) -> FleetResult<u16> {
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|_| FleetError::validation(field, format!("'{}' is not a valid port", raw)))?;
    if port == 0 {
        return Err(FleetError::validation(field, "port must be between 1 and 65535"));
    }
    Ok(port)
}

/// Lenient boolean parse: only a case-insensitive "true" is true.
pub fn parse_flag(raw: Option<&String>) -> bool {
    raw.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Check a header pair, returning the canonical (lowercase) name.
pub fn header_pair(name: &str, value: &str) -> FleetResult<(String, String)> {
    let parsed = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| FleetError::validation("headers", format!("'{}' is not a valid header name", name)))?;
    HeaderValue::from_str(value)
        .map_err(|_| FleetError::validation("headers", format!("invalid value for header '{}'", name)))?;
    Ok((parsed.as_str().to_string(), value.to_string()))
}
