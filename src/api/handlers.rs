use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::params::{Params, ScriptBody};
use crate::api::ApiState;
use crate::controller::{parse_limit_params, parse_timeout_params};
use crate::error::{FleetError, FleetResult};
use crate::har::Har;
use crate::instance::{EngineLogLevel, LaunchSpec, SystemProxy, UpstreamProxy};
use crate::settings::{Allowlist, BlocklistRule, CaptureType, CaptureTypes};
use crate::validate::{parse_port, parse_status};

#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyList {
    pub proxy_list: Vec<ProxyDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> FleetResult<T> {
    body.map(|Json(value)| value)
        .map_err(|e| FleetError::validation("body", e.body_text()))
}

fn har_or_no_content(har: Option<Har>) -> Response {
    match har {
        Some(har) => Json(har).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn parse_ip(field: &str, raw: Option<&str>) -> FleetResult<Option<IpAddr>> {
    raw.map(|value| {
        value
            .parse::<IpAddr>()
            .map_err(|_| FleetError::validation(field, format!("'{}' is not an IP address", value)))
    })
    .transpose()
}

pub async fn list_proxies(State(state): State<ApiState>) -> Json<ProxyList> {
    let proxy_list = state
        .registry
        .list()
        .iter()
        .map(|instance| ProxyDescriptor { port: instance.port() })
        .collect();
    Json(ProxyList { proxy_list })
}

/// Translate create parameters into a launch spec. Without `httpProxy`,
/// the system proxy (if any) is used, with its own bypass list unless
/// `httpNonProxyHosts` overrides it.
pub fn launch_spec(params: &Params, system: &SystemProxy) -> FleetResult<LaunchSpec> {
    let explicit = params.non_empty("httpProxy").map(str::to_string);
    let from_system = explicit.is_none();
    let upstream_proxy = explicit.or_else(|| system.address.clone()).map(|address| {
        let non_proxy_hosts = match params.non_empty("httpNonProxyHosts") {
            Some(hosts) => hosts
                .split('|')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
            None if from_system => system.non_proxy_hosts.clone(),
            None => Vec::new(),
        };
        let username = params.non_empty("proxyUsername").map(str::to_string);
        let password = params.get("proxyPassword").cloned();
        if from_system {
            UpstreamProxy {
                address,
                username: username.or_else(|| system.username.clone()),
                password: password.or_else(|| system.password.clone()),
                https: params.flag("proxyHTTPS") || system.https,
                non_proxy_hosts,
            }
        } else {
            UpstreamProxy {
                address,
                username,
                password,
                https: params.flag("proxyHTTPS"),
                non_proxy_hosts,
            }
        }
    });

    Ok(LaunchSpec {
        upstream_proxy,
        requested_port: params.non_empty("port").map(|p| parse_port("port", p)).transpose()?,
        bind_address: parse_ip("bindAddress", params.non_empty("bindAddress"))?,
        server_bind_address: parse_ip("serverBindAddress", params.non_empty("serverBindAddress"))?,
        use_ecc: params.flag("useEcc"),
        trust_all_servers: params.flag("trustAllServers"),
        log_level: params
            .non_empty("mitmProxyLoggingLevel")
            .map(str::parse::<EngineLogLevel>)
            .transpose()?
            .unwrap_or_default(),
    })
}

pub async fn create_proxy(State(state): State<ApiState>, params: Params) -> FleetResult<Json<ProxyDescriptor>> {
    let spec = launch_spec(&params, &state.system_proxy)?;
    let instance = state.registry.create(spec).await?;
    Ok(Json(ProxyDescriptor { port: instance.port() }))
}

pub async fn delete_proxy(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<StatusCode> {
    state.registry.delete(port).await?;
    Ok(StatusCode::OK)
}

pub async fn get_har(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<Response> {
    let instance = state.registry.require(port)?;
    Ok(har_or_no_content(instance.har(params.flag("cleanHar"))))
}

/// Capture flags requested by a new-session call.
pub fn capture_types(params: &Params) -> CaptureTypes {
    let mut capture = CaptureTypes::new();
    if params.flag("captureHeaders") {
        capture.extend(CaptureType::HEADERS);
    }
    if params.flag("captureCookies") {
        capture.extend(CaptureType::COOKIES);
    }
    if params.flag("captureContent") {
        capture.extend(CaptureType::ALL_CONTENT);
    }
    if params.flag("captureBinaryContent") {
        capture.extend(CaptureType::BINARY_CONTENT);
    }
    capture
}

pub async fn new_har(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<Response> {
    let instance = state.registry.require(port)?;
    let previous = instance.new_har(
        capture_types(&params),
        params.non_empty("initialPageRef").map(str::to_string),
        params.non_empty("initialPageTitle").map(str::to_string),
    )?;
    Ok(har_or_no_content(previous))
}

pub async fn new_page(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    instance.new_page(
        params.non_empty("pageRef").map(str::to_string),
        params.non_empty("pageTitle").map(str::to_string),
    );
    Ok(StatusCode::OK)
}

pub async fn end_page(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<StatusCode> {
    state.registry.require(port)?.end_page();
    Ok(StatusCode::OK)
}

pub async fn end_har(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<Response> {
    let instance = state.registry.require(port)?;
    Ok(har_or_no_content(instance.end_har()))
}

pub async fn find_entries(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<Response> {
    let instance = state.registry.require(port)?;
    let entries = instance.find_entries(params.required("urlPattern")?)?;
    Ok(Json(entries).into_response())
}

pub async fn most_recent_entry(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<Response> {
    let instance = state.registry.require(port)?;
    Ok(match instance.most_recent_entry(params.non_empty("urlPattern"))? {
        Some(entry) => Json(entry).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn get_blocklist(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<Json<Vec<BlocklistRule>>> {
    Ok(Json(state.registry.require(port)?.blocklist()))
}

pub async fn add_blocklist(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    instance.add_blocklist_rule(
        params.required("regex")?,
        parse_status(params.non_empty("status")),
        params.non_empty("method"),
    )?;
    Ok(StatusCode::OK)
}

pub async fn clear_blocklist(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<StatusCode> {
    state.registry.require(port)?.clear_blocklist()?;
    Ok(StatusCode::OK)
}

pub async fn get_allowlist(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<Json<Allowlist>> {
    Ok(Json(state.registry.require(port)?.allowlist()))
}

pub async fn set_allowlist(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    let patterns: Vec<&str> = params
        .required("regex")?
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    instance.set_allowlist(&patterns, parse_status(params.non_empty("status")))?;
    Ok(StatusCode::OK)
}

pub async fn disable_allowlist(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<StatusCode> {
    state.registry.require(port)?.disable_allowlist()?;
    Ok(StatusCode::OK)
}

pub async fn set_basic_auth(
    State(state): State<ApiState>,
    Path((port, domain)): Path<(u16, String)>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    let credentials = json_body(body)?;
    instance.set_basic_auth(&domain, &credentials.username, &credentials.password)?;
    Ok(StatusCode::OK)
}

pub async fn set_headers(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
    body: Result<Json<BTreeMap<String, String>>, JsonRejection>,
) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    instance.set_headers(&json_body(body)?)?;
    Ok(StatusCode::OK)
}

pub async fn add_request_filter(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
    ScriptBody(script): ScriptBody,
) -> FleetResult<StatusCode> {
    state.registry.require(port)?.add_request_script(script)?;
    Ok(StatusCode::OK)
}

pub async fn add_response_filter(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
    ScriptBody(script): ScriptBody,
) -> FleetResult<StatusCode> {
    state.registry.require(port)?.add_response_script(script)?;
    Ok(StatusCode::OK)
}

pub async fn set_limits(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    let update = parse_limit_params(&params.0)?;
    instance.set_bandwidth(update)?;
    Ok(StatusCode::OK)
}

pub async fn set_timeouts(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    let update = parse_timeout_params(&params.0)?;
    instance.set_timeouts(update)?;
    Ok(StatusCode::OK)
}

pub async fn remap_hosts(
    State(state): State<ApiState>,
    Path(port): Path<u16>,
    body: Result<Json<BTreeMap<String, String>>, JsonRejection>,
) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    instance.remap_hosts(&json_body(body)?)?;
    Ok(StatusCode::OK)
}

pub async fn clear_dns_cache(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<StatusCode> {
    state.registry.require(port)?.clear_dns_cache();
    Ok(StatusCode::OK)
}

pub async fn add_rewrite(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    let replacement = params.get("replace").map(String::as_str).unwrap_or("");
    instance.add_rewrite_rule(params.required("matchRegex")?, replacement)?;
    Ok(StatusCode::OK)
}

pub async fn clear_rewrites(State(state): State<ApiState>, Path(port): Path<u16>) -> FleetResult<StatusCode> {
    state.registry.require(port)?.clear_rewrite_rules()?;
    Ok(StatusCode::OK)
}

pub async fn wait(State(state): State<ApiState>, Path(port): Path<u16>, params: Params) -> FleetResult<StatusCode> {
    let instance = state.registry.require(port)?;
    let quiet = params.required_non_negative("quietPeriodInMs")?;
    let timeout = params.required_non_negative("timeoutInMs")?;
    instance
        .wait_for_quiescence(Duration::from_millis(quiet), Duration::from_millis(timeout))
        .await?;
    Ok(StatusCode::OK)
}

pub async fn retry(Path(_port): Path<u16>) -> FleetResult<StatusCode> {
    Err(FleetError::validation("retry", "no longer supported"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params(pairs: &[(&str, &str)]) -> Params {
        Params(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn system() -> SystemProxy {
        SystemProxy {
            address: Some("corp-proxy:3128".into()),
            https: false,
            username: Some("svc".into()),
            password: Some("pw".into()),
            non_proxy_hosts: vec!["*.internal".into()],
        }
    }

    #[test]
    fn test_launch_spec_falls_back_to_system_proxy() {
        let spec = launch_spec(&params(&[]), &system()).unwrap();
        let upstream = spec.upstream_proxy.unwrap();
        assert_eq!(upstream.address, "corp-proxy:3128");
        assert_eq!(upstream.username.as_deref(), Some("svc"));
        assert_eq!(upstream.non_proxy_hosts, vec!["*.internal"]);

        let spec = launch_spec(&params(&[("httpNonProxyHosts", "a.test|b.test")]), &system()).unwrap();
        assert_eq!(spec.upstream_proxy.unwrap().non_proxy_hosts, vec!["a.test", "b.test"]);

        assert!(launch_spec(&params(&[]), &SystemProxy::default())
            .unwrap()
            .upstream_proxy
            .is_none());
    }

    #[test]
    fn test_launch_spec_explicit_proxy_ignores_system() {
        let spec = launch_spec(&params(&[("httpProxy", "other:8080"), ("port", "9100")]), &system()).unwrap();
        let upstream = spec.upstream_proxy.unwrap();
        assert_eq!(upstream.address, "other:8080");
        assert!(upstream.username.is_none());
        assert!(upstream.non_proxy_hosts.is_empty());
        assert_eq!(spec.requested_port, Some(9100));
    }
}
