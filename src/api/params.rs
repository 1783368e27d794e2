//! Request parameter extraction for the control API.
//!
//! Control calls take their arguments as query parameters or as an
//! urlencoded form body; [`Params`] merges both (query wins). Filter scripts
//! arrive as a raw body in whatever charset the caller declared.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{FromRequest, Query, Request},
    http::{header, HeaderMap},
    Form,
};

use crate::charset;
use crate::error::{FleetError, FleetResult};
use crate::validate::{parse_flag, parse_non_negative, parse_optional};

/// Merged query and form parameters.
#[derive(Debug, Clone, Default)]
pub struct Params(pub HashMap<String, String>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&String> {
        self.0.get(name)
    }

    /// Parameter value, treating an empty string as absent.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    pub fn flag(&self, name: &str) -> bool {
        parse_flag(self.0.get(name))
    }

    pub fn non_negative(&self, name: &str) -> FleetResult<Option<u64>> {
        parse_optional(name, self.0.get(name))
    }

    pub fn required(&self, name: &str) -> FleetResult<&str> {
        self.non_empty(name)
            .ok_or_else(|| FleetError::validation(name, "is required"))
    }

    pub fn required_non_negative(&self, name: &str) -> FleetResult<u64> {
        parse_non_negative(name, self.required(name)?)
    }
}

impl<S> FromRequest<S> for Params
where
    S: Send + Sync,
{
    type Rejection = FleetError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(req.uri())
            .map_err(|e| FleetError::validation("query", e.body_text()))?;

        if is_form(req.headers()) {
            let Form(form) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| FleetError::validation("body", e.body_text()))?;
            for (name, value) in form {
                params.entry(name).or_insert(value);
            }
        }
        Ok(Params(params))
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    charset::content_type(headers)
        .is_some_and(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
}

/// A filter script, decoded with the charset named in `Content-Type`
/// (ISO-8859-1 when none is named).
#[derive(Debug, Clone)]
pub struct ScriptBody(pub String);

impl<S> FromRequest<S> for ScriptBody
where
    S: Send + Sync,
{
    type Rejection = FleetError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mime = charset::content_type(req.headers());
        let declared = req.headers().contains_key(header::CONTENT_TYPE);
        if declared && mime.is_none() {
            return Err(FleetError::validation("Content-Type", "malformed header"));
        }
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| FleetError::validation("body", e.body_text()))?;
        let script = charset::decode(mime.as_ref(), &body, charset::DEFAULT_HTTP_CHARSET)?;
        Ok(ScriptBody(script))
    }
}
