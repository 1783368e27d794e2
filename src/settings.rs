//! Per-instance live settings.
//!
//! # Data Flow
//! ```text
//! control call
//!     → controller.rs (validate input, no state touched on failure)
//!     → SettingsCell::update (writer lock, clone snapshot, apply, bump generation)
//!     → ArcSwap::store (single atomic pointer swap)
//!
//! engine, per request
//!     → SettingsCell::load (lock-free, whole snapshot)
//!     → traffic.rs (evaluate blocklist / allowlist / rewrites / headers)
//! ```
//!
//! A snapshot is never mutated after it is published, so the traffic path
//! can hold one for the lifetime of a request without seeing a half-applied
//! change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::config::InstanceDefaults;
use crate::error::FleetResult;
use crate::filter::TrafficFilter;
use crate::pattern::Pattern;

/// Categories of data recorded into the session log.
///
/// Flags are independent: enabling content capture does not enable header
/// capture for the same direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureType {
    RequestHeaders,
    RequestCookies,
    RequestContent,
    RequestBinaryContent,
    ResponseHeaders,
    ResponseCookies,
    ResponseContent,
    ResponseBinaryContent,
}

impl CaptureType {
    pub const HEADERS: [CaptureType; 2] = [CaptureType::RequestHeaders, CaptureType::ResponseHeaders];

    pub const COOKIES: [CaptureType; 2] = [CaptureType::RequestCookies, CaptureType::ResponseCookies];

    pub const BINARY_CONTENT: [CaptureType; 2] = [
        CaptureType::RequestBinaryContent,
        CaptureType::ResponseBinaryContent,
    ];

    /// Text and binary content for both directions.
    pub const ALL_CONTENT: [CaptureType; 4] = [
        CaptureType::RequestContent,
        CaptureType::ResponseContent,
        CaptureType::RequestBinaryContent,
        CaptureType::ResponseBinaryContent,
    ];
}

pub type CaptureTypes = BTreeSet<CaptureType>;

/// A blocklist entry: matching requests get `status_code` and never reach
/// the upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistRule {
    pub url_pattern: Pattern,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_pattern: Option<Pattern>,
}

impl BlocklistRule {
    pub fn matches(&self, method: &str, url: &str) -> bool {
        self.url_pattern.is_match(url)
            && self.method_pattern.as_ref().is_none_or(|m| m.is_match(method))
    }
}

/// Allowlist state. Rules survive `disable` and come back on the next enable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowlist {
    pub enabled: bool,
    pub patterns: Vec<Pattern>,
    pub status_code: u16,
}

impl Default for Allowlist {
    fn default() -> Self {
        Self {
            enabled: false,
            patterns: Vec::new(),
            status_code: crate::validate::DEFAULT_RULE_STATUS,
        }
    }
}

impl Allowlist {
    /// Status to answer with when `url` is outside the allowlist.
    pub fn rejects(&self, url: &str) -> Option<u16> {
        if self.enabled && !self.patterns.iter().any(|p| p.is_match(url)) {
            Some(self.status_code)
        } else {
            None
        }
    }
}

/// Regex/replacement pair applied to the request URL before dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteRule {
    pub match_pattern: Pattern,
    pub replacement: String,
}

impl RewriteRule {
    pub fn apply(&self, url: &str) -> String {
        self.match_pattern.replace_all(url, &self.replacement)
    }
}

/// Bandwidth shaping. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthLimits {
    pub upstream_bps: u64,
    pub downstream_bps: u64,
    /// Fixed delay added before each upstream dispatch.
    pub latency_ms: u64,
}

/// Timeouts in milliseconds. Zero means no timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub connect_ms: u64,
    pub request_ms: u64,
    pub idle_ms: u64,
}

impl Timeouts {
    pub fn connect(&self) -> Option<Duration> {
        non_zero_ms(self.connect_ms)
    }

    pub fn request(&self) -> Option<Duration> {
        non_zero_ms(self.request_ms)
    }

    pub fn idle(&self) -> Option<Duration> {
        non_zero_ms(self.idle_ms)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// DNS remaps and cache lifetimes. The cache itself lives in `dns::HostResolver`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSettings {
    /// Lowercased hostname → literal address or replacement hostname.
    pub remaps: BTreeMap<String, String>,
    pub positive_ttl_secs: u64,
    pub negative_ttl_secs: u64,
}

/// Immutable snapshot of everything the traffic path reads.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Bumped on every published change.
    pub generation: u64,
    pub capture: CaptureTypes,
    pub blocklist: Vec<BlocklistRule>,
    pub allowlist: Allowlist,
    /// Lowercased header name → value.
    pub headers: BTreeMap<String, String>,
    /// Host → base64 `user:password`.
    pub basic_auth: BTreeMap<String, String>,
    pub request_filters: Vec<Arc<dyn TrafficFilter>>,
    pub response_filters: Vec<Arc<dyn TrafficFilter>>,
    pub rewrites: Vec<RewriteRule>,
    pub bandwidth: BandwidthLimits,
    pub timeouts: Timeouts,
    pub dns: DnsSettings,
}

impl InstanceSettings {
    pub fn from_defaults(defaults: &InstanceDefaults) -> Self {
        Self {
            generation: 0,
            capture: CaptureTypes::new(),
            blocklist: Vec::new(),
            allowlist: Allowlist::default(),
            headers: BTreeMap::new(),
            basic_auth: BTreeMap::new(),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            rewrites: Vec::new(),
            bandwidth: BandwidthLimits::default(),
            timeouts: Timeouts {
                connect_ms: defaults.connect_timeout_ms,
                request_ms: defaults.request_timeout_ms,
                idle_ms: defaults.idle_timeout_ms,
            },
            dns: DnsSettings {
                remaps: BTreeMap::new(),
                positive_ttl_secs: defaults.dns_positive_ttl_secs,
                negative_ttl_secs: defaults.dns_negative_ttl_secs,
            },
        }
    }
}

/// Holder of the current snapshot.
///
/// Readers call [`load`](Self::load) and never block. Writers go through
/// [`update`](Self::update), which serializes them per instance; writers on
/// different instances use different cells and never contend.
#[derive(Debug)]
pub struct SettingsCell {
    current: ArcSwap<InstanceSettings>,
    writer: Mutex<()>,
}

impl SettingsCell {
    pub fn new(initial: InstanceSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<InstanceSettings> {
        self.current.load_full()
    }

    /// Apply `change` to a copy of the current snapshot and publish it.
    ///
    /// If `change` fails, nothing is published.
    pub fn update<F>(&self, change: F) -> FleetResult<Arc<InstanceSettings>>
    where
        F: FnOnce(&mut InstanceSettings) -> FleetResult<()>,
    {
        let _writer = self.writer.lock().expect("settings writer mutex poisoned");
        let mut next = InstanceSettings::clone(&self.current.load());
        change(&mut next)?;
        next.generation += 1;
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;

    fn cell() -> SettingsCell {
        SettingsCell::new(InstanceSettings::from_defaults(&InstanceDefaults::default()))
    }

    #[test]
    fn test_update_publishes_new_generation() {
        let cell = cell();
        let before = cell.load();
        cell.update(|s| {
            s.bandwidth.upstream_bps = 1024;
            Ok(())
        })
        .unwrap();

        let after = cell.load();
        assert_eq!(after.generation, before.generation + 1);
        assert_eq!(after.bandwidth.upstream_bps, 1024);
        // The old snapshot is untouched.
        assert_eq!(before.bandwidth.upstream_bps, 0);
    }

    #[test]
    fn test_failed_update_publishes_nothing() {
        let cell = cell();
        let result = cell.update(|s| {
            s.bandwidth.upstream_bps = 1;
            Err(FleetError::validation("x", "no"))
        });
        assert!(result.is_err());
        assert_eq!(cell.load().generation, 0);
        assert_eq!(cell.load().bandwidth.upstream_bps, 0);
    }

    #[test]
    fn test_blocklist_rule_method_filter() {
        let rule = BlocklistRule {
            url_pattern: Pattern::full_match("regex", r"http://x\.com/.*").unwrap(),
            status_code: 403,
            method_pattern: Some(Pattern::full_match("method", "POST|PUT").unwrap()),
        };
        assert!(rule.matches("POST", "http://x.com/a"));
        assert!(!rule.matches("GET", "http://x.com/a"));
        assert!(!rule.matches("POST", "http://y.com/a"));
    }

    #[test]
    fn test_allowlist_rejects_only_when_enabled() {
        let mut allow = Allowlist {
            enabled: false,
            patterns: vec![Pattern::full_match("regex", r"http://ok\.com/.*").unwrap()],
            status_code: 404,
        };
        assert_eq!(allow.rejects("http://other.com/"), None);

        allow.enabled = true;
        assert_eq!(allow.rejects("http://other.com/"), Some(404));
        assert_eq!(allow.rejects("http://ok.com/page"), None);
    }

    #[test]
    fn test_timeouts_zero_means_none() {
        let t = Timeouts {
            connect_ms: 0,
            request_ms: 250,
            idle_ms: 0,
        };
        assert_eq!(t.connect(), None);
        assert_eq!(t.request(), Some(Duration::from_millis(250)));
    }
}
