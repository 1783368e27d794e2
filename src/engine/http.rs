//! Plain-HTTP forwarding engine.
//!
//! # Responsibilities
//! - Bind the instance port and serve absolute-form proxy requests
//! - Apply the instance's settings snapshot to every request
//! - Forward upstream (directly or through the configured upstream proxy)
//! - Record each exchange into the session log and report activity
//!
//! # Design Decisions
//! - One settings snapshot per request: a concurrent control call never
//!   changes policy half-way through an exchange
//! - Bodies are buffered, which makes bandwidth shaping a matter of
//!   sleeping for `bytes / rate` in each direction
//! - One upstream client is cached per instance and rebuilt when the
//!   connect or idle timeout changes
//! - `CONNECT` is answered 501: TLS interception is not provided

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use arc_swap::ArcSwapOption;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::charset;
use crate::engine::{EngineError, EngineHandle, ProxyEngine};
use crate::filter::{FilterRequest, FilterResponse};
use crate::har::{self, HarContent, HarEntry, HarNameValue, HarPostData, HarRequest, HarResponse};
use crate::instance::{InstanceRuntime, LaunchSpec, UpstreamProxy};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::settings::{CaptureType, CaptureTypes, InstanceSettings, Timeouts};
use crate::traffic::{self, Verdict};

/// Largest request or response body the engine buffers.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// How long `stop` lets in-flight requests drain before aborting.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// The default engine: one axum listener per instance.
#[derive(Debug, Default, Clone)]
pub struct HttpEngine;

impl HttpEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProxyEngine for HttpEngine {
    async fn start(
        &self,
        port: u16,
        spec: &LaunchSpec,
        runtime: Arc<InstanceRuntime>,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        let ip = spec.bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = TcpListener::bind(SocketAddr::new(ip, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => EngineError::AddressInUse(port),
                _ => EngineError::Bind(e),
            })?;
        let local_addr = listener.local_addr().map_err(EngineError::Bind)?;

        let state = EngineState {
            runtime,
            upstream: spec.upstream_proxy.clone(),
            trust_all_servers: spec.trust_all_servers,
            server_bind_address: spec.server_bind_address,
            client: Arc::new(ArcSwapOption::empty()),
        };
        // A bad client configuration fails the start.
        state.client(&state.runtime.settings.load().timeouts)?;

        let app = Router::new().fallback(proxy_handler).with_state(state);
        let shutdown = Shutdown::new();
        let signal = shutdown.signalled();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                tracing::error!(port, error = %e, "Proxy listener failed");
            }
        });

        tracing::info!(
            port,
            address = %local_addr,
            log_level = ?spec.log_level,
            upstream = spec.upstream_proxy.as_ref().map(|u| u.address.as_str()),
            "Proxy engine started"
        );

        Ok(Box::new(HttpHandle {
            local_addr,
            shutdown,
            task: Some(task),
        }))
    }
}

#[derive(Debug)]
struct HttpHandle {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl EngineHandle for HttpHandle {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn stop(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        self.shutdown.trigger();
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            tracing::warn!(address = %self.local_addr, "Proxy engine did not drain in time, aborting");
            task.abort();
            // Wait for the abort so the listener is closed before we return.
            let _ = task.await;
        }
        tracing::info!(address = %self.local_addr, "Proxy engine stopped");
    }
}

/// Per-instance state injected into the handler.
#[derive(Clone)]
struct EngineState {
    runtime: Arc<InstanceRuntime>,
    upstream: Option<UpstreamProxy>,
    trust_all_servers: bool,
    server_bind_address: Option<IpAddr>,
    client: Arc<ArcSwapOption<CachedClient>>,
}

/// Upstream client built for one (connect, idle) timeout pair.
struct CachedClient {
    timeouts: (u64, u64),
    client: reqwest::Client,
}

impl EngineState {
    fn client(&self, timeouts: &Timeouts) -> Result<reqwest::Client, EngineError> {
        let key = (timeouts.connect_ms, timeouts.idle_ms);
        if let Some(cached) = &*self.client.load() {
            if cached.timeouts == key {
                return Ok(cached.client.clone());
            }
        }

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(self.trust_all_servers)
            .dns_resolver(Arc::new(InstanceDns {
                runtime: Arc::clone(&self.runtime),
            }));
        if let Some(connect) = timeouts.connect() {
            builder = builder.connect_timeout(connect);
        }
        if let Some(idle) = timeouts.idle() {
            builder = builder.read_timeout(idle).pool_idle_timeout(idle);
        }
        if let Some(addr) = self.server_bind_address {
            builder = builder.local_address(addr);
        }
        builder = match &self.upstream {
            Some(upstream) => builder.proxy(upstream_proxy(upstream)),
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(|e| EngineError::Client(e.to_string()))?;
        // Replaces the client for the previous timeouts; its pool goes with it.
        self.client.store(Some(Arc::new(CachedClient {
            timeouts: key,
            client: client.clone(),
        })));
        tracing::debug!(port = self.runtime.port, connect_ms = key.0, idle_ms = key.1, "Upstream client rebuilt");
        Ok(client)
    }

    #[cfg(test)]
    fn cached_timeouts(&self) -> Option<(u64, u64)> {
        self.client.load_full().map(|cached| cached.timeouts)
    }
}

fn upstream_proxy(upstream: &UpstreamProxy) -> reqwest::Proxy {
    let target = upstream.url();
    let rules = upstream.clone();
    let proxy = reqwest::Proxy::custom(move |url| {
        let direct = url.host_str().is_some_and(|host| rules.bypasses(host));
        (!direct).then(|| target.clone())
    });
    match &upstream.username {
        Some(user) => proxy.basic_auth(user, upstream.password.as_deref().unwrap_or("")),
        None => proxy,
    }
}

/// Routes upstream DNS lookups through the instance's resolver, so host
/// remaps and cache TTLs apply to http and https alike.
struct InstanceDns {
    runtime: Arc<InstanceRuntime>,
}

impl Resolve for InstanceDns {
    fn resolve(&self, name: Name) -> Resolving {
        let runtime = Arc::clone(&self.runtime);
        Box::pin(async move {
            let settings = runtime.settings.load();
            let ips = runtime.resolver.resolve(name.as_str(), &settings.dns).await?;
            // The connector fills in the port from the request URL.
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// Exchange data gathered while servicing one request.
struct Exchange {
    started_at: DateTime<Utc>,
    start: Instant,
    request: FilterRequest,
    query: Vec<HarNameValue>,
}

async fn proxy_handler(State(state): State<EngineState>, request: Request) -> Response {
    let _activity = state.runtime.activity.begin();
    let port = state.runtime.port;
    let start = Instant::now();
    let started_at = Utc::now();
    let request_id = Uuid::new_v4();

    if request.method() == Method::CONNECT {
        tracing::debug!(port, %request_id, target = %request.uri(), "CONNECT not supported");
        metrics::record_request(port, "unsupported", start);
        return (StatusCode::NOT_IMPLEMENTED, "CONNECT tunnelling is not supported").into_response();
    }

    let Some(url) = absolute_url(&request) else {
        metrics::record_request(port, "bad_request", start);
        return (StatusCode::BAD_REQUEST, "proxy requests need an absolute URL").into_response();
    };
    let normalized = har::normalize_url(&url);
    let method = request.method().as_str().to_string();
    let settings = state.runtime.settings.load();

    tracing::debug!(port, %request_id, method = %method, url = %normalized, "Proxying request");

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(port, %request_id, error = %e, "Failed to read request body");
            metrics::record_request(port, "bad_request", start);
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    let mut exchange = Exchange {
        started_at,
        start,
        request: FilterRequest {
            method: method.clone(),
            url: normalized.clone(),
            headers: forwardable(&parts.headers),
            body,
        },
        query: url
            .query_pairs()
            .map(|(k, v)| HarNameValue::new(k, v))
            .collect(),
    };

    let dispatch = match traffic::evaluate(&settings, &method, &normalized) {
        Verdict::Respond { status, reason } => {
            tracing::info!(port, %request_id, url = %normalized, status, reason = reason.as_str(), "Request answered locally");
            let response = FilterResponse::new(status, Bytes::new());
            return finish(&state, &settings, exchange, response, None, reason.as_str());
        }
        Verdict::Dispatch(dispatch) => dispatch,
    };

    exchange.request.url = dispatch.url;
    for (name, value) in &dispatch.extra_headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            exchange.request.headers.insert(name, value);
        }
    }

    if let Some(canned) = traffic::apply_request_filters(&settings.request_filters, &mut exchange.request) {
        tracing::info!(port, %request_id, status = canned.status, "Request answered by filter");
        return finish(&state, &settings, exchange, canned, None, "filtered");
    }

    let target = match Url::parse(&exchange.request.url) {
        Ok(target) => target,
        Err(e) => {
            tracing::warn!(port, %request_id, url = %exchange.request.url, error = %e, "Rewritten URL is invalid");
            let response = FilterResponse::new(StatusCode::BAD_REQUEST.as_u16(), Bytes::from("rewritten URL is invalid"));
            return finish(&state, &settings, exchange, response, None, "bad_request");
        }
    };

    let bandwidth = settings.bandwidth;
    if bandwidth.latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(bandwidth.latency_ms)).await;
    }
    let upstream_delay = traffic::transfer_delay(exchange.request.body.len(), bandwidth.upstream_bps);
    if !upstream_delay.is_zero() {
        tokio::time::sleep(upstream_delay).await;
    }

    let client = match state.client(&settings.timeouts) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(port, %request_id, error = %e, "Upstream client unavailable");
            let response = FilterResponse::new(StatusCode::BAD_GATEWAY.as_u16(), Bytes::new());
            return finish(&state, &settings, exchange, response, None, "upstream_error");
        }
    };

    let method = match reqwest::Method::from_bytes(exchange.request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => reqwest::Method::GET,
    };
    let mut outgoing = client
        .request(method, target)
        .headers(exchange.request.headers.clone())
        .body(exchange.request.body.clone());
    if let Some(limit) = settings.timeouts.request() {
        outgoing = outgoing.timeout(limit);
    }

    let upstream = match outgoing.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            let (status, outcome) = if e.is_timeout() {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            } else {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            };
            tracing::warn!(port, %request_id, url = %exchange.request.url, error = %e, "Upstream request failed");
            let response = FilterResponse::new(status.as_u16(), Bytes::new());
            return finish(&state, &settings, exchange, response, None, outcome);
        }
    };

    let server_ip = upstream.remote_addr().map(|addr| addr.ip().to_string());
    let status = upstream.status().as_u16();
    let headers = forwardable(upstream.headers());
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            let (status, outcome) = if e.is_timeout() {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            } else {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            };
            tracing::warn!(port, %request_id, error = %e, "Failed to read upstream body");
            let response = FilterResponse::new(status.as_u16(), Bytes::new());
            return finish(&state, &settings, exchange, response, server_ip, outcome);
        }
    };

    let downstream_delay = traffic::transfer_delay(body.len(), bandwidth.downstream_bps);
    if !downstream_delay.is_zero() {
        tokio::time::sleep(downstream_delay).await;
    }

    let mut response = FilterResponse { status, headers, body };
    traffic::apply_response_filters(&settings.response_filters, &exchange.request, &mut response);

    tracing::debug!(port, %request_id, status = response.status, elapsed_ms = start.elapsed().as_millis() as u64, "Request forwarded");
    finish(&state, &settings, exchange, response, server_ip, "forwarded")
}

/// Record the exchange, emit metrics and build the client response.
fn finish(
    state: &EngineState,
    settings: &InstanceSettings,
    exchange: Exchange,
    response: FilterResponse,
    server_ip: Option<String>,
    outcome: &'static str,
) -> Response {
    let recorder = &state.runtime.recorder;
    if recorder.is_capturing() {
        recorder.record(har_entry(&settings.capture, &exchange, &response, server_ip));
    }
    metrics::record_request(state.runtime.port, outcome, exchange.start);

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    *out.headers_mut() = response.headers;
    out
}

/// The request URL in absolute form, falling back to the Host header for
/// origin-form requests.
fn absolute_url(request: &Request) -> Option<Url> {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }
    let host = request.headers().get(header::HOST)?.to_str().ok()?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Url::parse(&format!("http://{}{}", host, path)).ok()
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name == header::HOST || HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn har_entry(
    capture: &CaptureTypes,
    exchange: &Exchange,
    response: &FilterResponse,
    server_ip: Option<String>,
) -> HarEntry {
    let request = &exchange.request;
    let request_mime = charset::content_type(&request.headers);
    let response_mime = charset::content_type(&response.headers);

    let post_data = (!request.body.is_empty())
        .then(|| {
            body_capture(
                capture,
                CaptureType::RequestContent,
                CaptureType::RequestBinaryContent,
                request_mime.as_ref(),
                &request.body,
            )
        })
        .flatten()
        .map(|(text, encoding)| HarPostData {
            mime_type: mime_string(request_mime.as_ref()),
            text,
            encoding,
        });

    let (text, encoding) = body_capture(
        capture,
        CaptureType::ResponseContent,
        CaptureType::ResponseBinaryContent,
        response_mime.as_ref(),
        &response.body,
    )
    .map_or((None, None), |(text, encoding)| (Some(text), encoding));

    HarEntry {
        pageref: None,
        started_date_time: exchange.started_at,
        time: exchange.start.elapsed().as_millis() as u64,
        request: HarRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            http_version: "HTTP/1.1".to_string(),
            headers: if capture.contains(&CaptureType::RequestHeaders) {
                name_values(&request.headers)
            } else {
                Vec::new()
            },
            cookies: if capture.contains(&CaptureType::RequestCookies) {
                request_cookies(&request.headers)
            } else {
                Vec::new()
            },
            query_string: exchange.query.clone(),
            post_data,
            headers_size: -1,
            body_size: request.body.len() as i64,
        },
        response: HarResponse {
            status: response.status,
            status_text: StatusCode::from_u16(response.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("")
                .to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: if capture.contains(&CaptureType::ResponseHeaders) {
                name_values(&response.headers)
            } else {
                Vec::new()
            },
            cookies: if capture.contains(&CaptureType::ResponseCookies) {
                response_cookies(&response.headers)
            } else {
                Vec::new()
            },
            content: HarContent {
                size: response.body.len() as i64,
                mime_type: mime_string(response_mime.as_ref()),
                text,
                encoding,
            },
            redirect_url: response
                .headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            headers_size: -1,
            body_size: response.body.len() as i64,
        },
        server_ip_address: server_ip,
    }
}

/// Text (decoded) or base64 body, depending on type and capture flags.
fn body_capture(
    capture: &CaptureTypes,
    text_flag: CaptureType,
    binary_flag: CaptureType,
    mime: Option<&mime::Mime>,
    body: &[u8],
) -> Option<(String, Option<String>)> {
    if charset::is_text(mime) {
        if !capture.contains(&text_flag) {
            return None;
        }
        // Undecodable charsets fall back to UTF-8 here; the body is already on the wire.
        let text = charset::decode(mime, body, encoding_rs::UTF_8)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
        Some((text, None))
    } else if capture.contains(&binary_flag) {
        Some((
            base64::engine::general_purpose::STANDARD.encode(body),
            Some("base64".to_string()),
        ))
    } else {
        None
    }
}

fn mime_string(mime: Option<&mime::Mime>) -> String {
    mime.map(|m| m.to_string()).unwrap_or_default()
}

fn name_values(headers: &HeaderMap) -> Vec<HarNameValue> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| HarNameValue::new(name.as_str(), v)))
        .collect()
}

fn request_cookies(headers: &HeaderMap) -> Vec<HarNameValue> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(split_cookie)
        .collect()
}

fn response_cookies(headers: &HeaderMap) -> Vec<HarNameValue> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|line| line.split(';').next())
        .filter_map(split_cookie)
        .collect()
}

fn split_cookie(pair: &str) -> Option<HarNameValue> {
    let (name, value) = pair.trim().split_once('=')?;
    (!name.is_empty()).then(|| HarNameValue::new(name, value))
}
