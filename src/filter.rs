//! Request/response filter capabilities.
//!
//! The control plane stores and orders filters; it never looks inside them.
//! A filter is anything implementing [`TrafficFilter`]. Two variants ship
//! with the crate:
//! - [`ScriptFilter`]: a script body submitted over the API, executed by a
//!   pluggable [`ScriptHost`].
//! - [`NativeFilter`]: a Rust closure, for embedders and tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use bytes::Bytes;

/// Mutable view of an outgoing request handed to filters.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Mutable view of a response handed to filters, or a canned response
/// produced by a request filter.
#[derive(Debug, Clone)]
pub struct FilterResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FilterResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A request/response mutation capability.
pub trait TrafficFilter: Send + Sync + fmt::Debug {
    /// Inspect or rewrite the request. Returning a response short-circuits
    /// the request: later filters and the upstream are skipped.
    fn apply_to_request(&self, _request: &mut FilterRequest) -> Option<FilterResponse> {
        None
    }

    /// Inspect or rewrite the response.
    fn apply_to_response(&self, _request: &FilterRequest, _response: &mut FilterResponse) {}
}

/// Executes filter scripts on behalf of [`ScriptFilter`].
pub trait ScriptHost: Send + Sync + fmt::Debug {
    fn run_request_script(&self, script: &str, request: &mut FilterRequest) -> Option<FilterResponse>;

    fn run_response_script(&self, script: &str, request: &FilterRequest, response: &mut FilterResponse);
}

/// Host used when no script runtime is linked in: scripts are accepted and
/// stored, traffic passes through untouched.
#[derive(Debug, Default)]
pub struct PassthroughScriptHost {
    warned: AtomicBool,
}

impl PassthroughScriptHost {
    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("No script runtime configured; filter scripts are stored but not executed");
        }
    }
}

impl ScriptHost for PassthroughScriptHost {
    fn run_request_script(&self, _script: &str, _request: &mut FilterRequest) -> Option<FilterResponse> {
        self.warn_once();
        None
    }

    fn run_response_script(&self, _script: &str, _request: &FilterRequest, _response: &mut FilterResponse) {
        self.warn_once();
    }
}

/// Which side of the exchange a script filter runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    Request,
    Response,
}

/// A filter backed by a script body.
#[derive(Debug)]
pub struct ScriptFilter {
    phase: FilterPhase,
    script: String,
    host: Arc<dyn ScriptHost>,
}

impl ScriptFilter {
    pub fn request(script: impl Into<String>, host: Arc<dyn ScriptHost>) -> Self {
        Self {
            phase: FilterPhase::Request,
            script: script.into(),
            host,
        }
    }

    pub fn response(script: impl Into<String>, host: Arc<dyn ScriptHost>) -> Self {
        Self {
            phase: FilterPhase::Response,
            script: script.into(),
            host,
        }
    }

    pub fn phase(&self) -> FilterPhase {
        self.phase
    }

    pub fn script(&self) -> &str {
        &self.script
    }
}

impl TrafficFilter for ScriptFilter {
    fn apply_to_request(&self, request: &mut FilterRequest) -> Option<FilterResponse> {
        match self.phase {
            FilterPhase::Request => self.host.run_request_script(&self.script, request),
            FilterPhase::Response => None,
        }
    }

    fn apply_to_response(&self, request: &FilterRequest, response: &mut FilterResponse) {
        if self.phase == FilterPhase::Response {
            self.host.run_response_script(&self.script, request, response);
        }
    }
}

type RequestHook = Box<dyn Fn(&mut FilterRequest) -> Option<FilterResponse> + Send + Sync>;
type ResponseHook = Box<dyn Fn(&FilterRequest, &mut FilterResponse) + Send + Sync>;

/// A filter backed by Rust closures.
pub struct NativeFilter {
    name: String,
    on_request: Option<RequestHook>,
    on_response: Option<ResponseHook>,
}

impl NativeFilter {
    pub fn on_request<F>(name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut FilterRequest) -> Option<FilterResponse> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            on_request: Some(Box::new(hook)),
            on_response: None,
        }
    }

    pub fn on_response<F>(name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&FilterRequest, &mut FilterResponse) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            on_request: None,
            on_response: Some(Box::new(hook)),
        }
    }
}

impl fmt::Debug for NativeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFilter").field("name", &self.name).finish()
    }
}

impl TrafficFilter for NativeFilter {
    fn apply_to_request(&self, request: &mut FilterRequest) -> Option<FilterResponse> {
        self.on_request.as_ref().and_then(|hook| hook(request))
    }

    fn apply_to_response(&self, request: &FilterRequest, response: &mut FilterResponse) {
        if let Some(hook) = &self.on_response {
            hook(request, response);
        }
    }
}
