//! Control API.
//!
//! # Responsibilities
//! - Map the REST surface onto registry and controller calls
//! - Translate `FleetError` into status codes
//! - Wrap every call in request-id and trace layers
//!
//! Every per-instance route resolves its instance first, so a missing or
//! retiring port answers 404 before any parameter is looked at.

pub mod error;
pub mod handlers;
pub mod params;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::Request,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::instance::SystemProxy;
use crate::registry::ProxyRegistry;
use self::handlers::*;

/// State shared by all control handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ProxyRegistry>,
    /// Upstream proxy for create calls that name none.
    pub system_proxy: Arc<SystemProxy>,
}

/// Build the control router. Request bodies above `max_body_size` get 413.
pub fn router(registry: Arc<ProxyRegistry>, max_body_size: usize) -> Router {
    let state = ApiState {
        registry,
        system_proxy: Arc::new(SystemProxy::from_env()),
    };

    Router::new()
        .route("/proxy", get(list_proxies).post(create_proxy))
        .route("/proxy/{port}", delete(delete_proxy))
        .route("/proxy/{port}/har", get(get_har).put(new_har))
        .route("/proxy/{port}/har/pageRef", put(new_page))
        .route("/proxy/{port}/har/commands/endPage", post(end_page))
        .route("/proxy/{port}/har/commands/endHar", post(end_har))
        .route("/proxy/{port}/har/entries", get(find_entries))
        .route("/proxy/{port}/har/mostRecentEntry", get(most_recent_entry))
        .route(
            "/proxy/{port}/blocklist",
            get(get_blocklist).put(add_blocklist).delete(clear_blocklist),
        )
        .route(
            "/proxy/{port}/allowlist",
            get(get_allowlist).put(set_allowlist).delete(disable_allowlist),
        )
        .route("/proxy/{port}/auth/basic/{domain}", post(set_basic_auth))
        .route("/proxy/{port}/headers", post(set_headers))
        .route("/proxy/{port}/filter/request", post(add_request_filter))
        .route("/proxy/{port}/filter/response", post(add_response_filter))
        .route("/proxy/{port}/limit", put(set_limits))
        .route("/proxy/{port}/timeout", put(set_timeouts))
        .route("/proxy/{port}/hosts", post(remap_hosts))
        .route("/proxy/{port}/dns/cache", delete(clear_dns_cache))
        .route("/proxy/{port}/rewrite", put(add_rewrite).delete(clear_rewrites))
        .route("/proxy/{port}/wait", put(wait))
        .route("/proxy/{port}/retry", put(retry))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            tracing::info_span!(
                "control",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        }))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
