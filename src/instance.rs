//! Proxy instance state.
//!
//! An instance is the unit the registry hands out: the launch parameters it
//! was created with, the shared runtime its engine reads on every request,
//! and the engine handle used to stop it.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::activity::ActivityMonitor;
use crate::dns::HostResolver;
use crate::engine::EngineHandle;
use crate::error::FleetError;
use crate::filter::ScriptHost;
use crate::har::SessionRecorder;
use crate::settings::{InstanceSettings, SettingsCell};

/// A further proxy this instance forwards through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamProxy {
    /// `host:port`.
    pub address: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Talk TLS to the upstream proxy itself.
    pub https: bool,
    /// Hosts reached directly. `*.example.com` and `10.*` wildcards allowed.
    pub non_proxy_hosts: Vec<String>,
}

impl UpstreamProxy {
    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}", scheme, self.address)
    }

    /// Whether requests to `host` skip the upstream proxy.
    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.non_proxy_hosts.iter().any(|pattern| {
            let pattern = pattern.trim().to_ascii_lowercase();
            if let Some(suffix) = pattern.strip_prefix('*') {
                host.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                host.starts_with(prefix)
            } else {
                host == pattern
            }
        })
    }
}

/// Process-wide upstream proxy, applied when a create call names none.
///
/// Read from `HTTP_PROXY` and `NO_PROXY` (either case). `NO_PROXY` entries
/// are comma-separated; a leading dot becomes a `*.` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemProxy {
    /// `host:port`.
    pub address: Option<String>,
    pub https: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub non_proxy_hosts: Vec<String>,
}

impl SystemProxy {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |upper: &str, lower: &str| {
            var(upper)
                .or_else(|| var(lower))
                .filter(|value| !value.trim().is_empty())
        };

        let mut proxy = Self::default();
        if let Some(raw) = lookup("HTTP_PROXY", "http_proxy") {
            let raw = raw.trim();
            let absolute = if raw.contains("://") {
                raw.to_string()
            } else {
                format!("http://{}", raw)
            };
            match Url::parse(&absolute) {
                Ok(url) => {
                    if let Some(host) = url.host_str() {
                        let port = url.port_or_known_default().unwrap_or(80);
                        proxy.address = Some(format!("{}:{}", host, port));
                        proxy.https = url.scheme() == "https";
                        if !url.username().is_empty() {
                            proxy.username = Some(url.username().to_string());
                            proxy.password = url.password().map(str::to_string);
                        }
                    }
                }
                Err(e) => tracing::warn!(value = raw, error = %e, "Ignoring malformed HTTP_PROXY"),
            }
        }
        if let Some(raw) = lookup("NO_PROXY", "no_proxy") {
            proxy.non_proxy_hosts = raw
                .split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(|host| match host.strip_prefix('.') {
                    Some(domain) => format!("*.{}", domain),
                    None => host.to_string(),
                })
                .collect();
        }
        proxy
    }
}

/// Engine log verbosity requested at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Alert,
    Debug,
}

impl FromStr for EngineLogLevel {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "alert" => Ok(Self::Alert),
            "debug" => Ok(Self::Debug),
            other => Err(FleetError::validation(
                "mitmProxyLoggingLevel",
                format!("unknown level '{}'", other),
            )),
        }
    }
}

/// Everything a create call can ask for.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub upstream_proxy: Option<UpstreamProxy>,
    /// `None` lets the registry probe its port range.
    pub requested_port: Option<u16>,
    /// Address the instance listens on. Defaults to all interfaces.
    pub bind_address: Option<IpAddr>,
    /// Local address for upstream connections.
    pub server_bind_address: Option<IpAddr>,
    pub use_ecc: bool,
    pub trust_all_servers: bool,
    pub log_level: EngineLogLevel,
}

/// State shared between an instance's engine and the control plane.
#[derive(Debug)]
pub struct InstanceRuntime {
    pub port: u16,
    pub settings: SettingsCell,
    pub resolver: HostResolver,
    pub recorder: SessionRecorder,
    pub activity: ActivityMonitor,
    pub script_host: Arc<dyn ScriptHost>,
}

impl InstanceRuntime {
    pub fn new(port: u16, initial: InstanceSettings, script_host: Arc<dyn ScriptHost>) -> Self {
        Self {
            port,
            settings: SettingsCell::new(initial),
            resolver: HostResolver::new(),
            recorder: SessionRecorder::new(),
            activity: ActivityMonitor::new(),
            script_host,
        }
    }
}

/// A live proxy instance.
pub struct ProxyInstance {
    runtime: Arc<InstanceRuntime>,
    spec: LaunchSpec,
    local_addr: SocketAddr,
    created_at: DateTime<Utc>,
    engine: tokio::sync::Mutex<Option<Box<dyn EngineHandle>>>,
    retiring: AtomicBool,
}

impl ProxyInstance {
    pub(crate) fn new(runtime: Arc<InstanceRuntime>, spec: LaunchSpec, engine: Box<dyn EngineHandle>) -> Self {
        Self {
            local_addr: engine.local_addr(),
            runtime,
            spec,
            created_at: Utc::now(),
            engine: tokio::sync::Mutex::new(Some(engine)),
            retiring: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.runtime.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn runtime(&self) -> &Arc<InstanceRuntime> {
        &self.runtime
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<InstanceSettings> {
        self.runtime.settings.load()
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.runtime.recorder
    }

    pub fn activity(&self) -> &ActivityMonitor {
        &self.runtime.activity
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    /// Mark the instance as being torn down. Only the first caller gets `true`.
    pub(crate) fn begin_retire(&self) -> bool {
        !self.retiring.swap(true, Ordering::AcqRel)
    }

    /// Stop the engine and wait for it. Later calls are no-ops.
    pub(crate) async fn stop_engine(&self) {
        let handle = self.engine.lock().await.take();
        if let Some(mut handle) = handle {
            handle.stop().await;
        }
    }
}

impl fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("port", &self.port())
            .field("local_addr", &self.local_addr)
            .field("retiring", &self.is_retiring())
            .finish()
    }
}
