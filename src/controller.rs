//! Configuration controller: validated, all-or-nothing changes to one
//! live instance.
//!
//! # Data Flow
//! ```text
//! API handler / embedder
//!     → parse_*_params (reject bad or legacy input, nothing touched yet)
//!     → ProxyInstance::<mutator> (compile patterns, check headers)
//!     → SettingsCell::update (publish one new snapshot)
//!     → engine sees the change on its next request
//! ```
//!
//! Every mutator validates before it enters `update`; whatever can still
//! fail inside the closure aborts the update without publishing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;

use crate::error::{FleetError, FleetResult};
use crate::filter::{ScriptFilter, TrafficFilter};
use crate::har::{self, Har, HarEntry};
use crate::instance::ProxyInstance;
use crate::observability::metrics;
use crate::pattern::Pattern;
use crate::settings::{Allowlist, BlocklistRule, CaptureTypes, RewriteRule};
use crate::validate::{header_pair, parse_optional};

/// Query parameters the limit call used to accept and now rejects.
const LEGACY_LIMIT_PARAMS: [&str; 5] = [
    "upstreamMaxKB",
    "downstreamMaxKB",
    "payloadPercentage",
    "maxBitsPerSecond",
    "enable",
];

/// Bandwidth change. `None` leaves a value as it is; `Some(0)` lifts the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthUpdate {
    pub upstream_bps: Option<u64>,
    pub downstream_bps: Option<u64>,
    pub latency_ms: Option<u64>,
}

/// Timeout change. `None` leaves a value as it is; `Some(0)` disables it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutUpdate {
    pub connect_ms: Option<u64>,
    pub request_ms: Option<u64>,
    pub idle_ms: Option<u64>,
    /// Applies to both the positive and the negative DNS cache.
    pub dns_ttl_secs: Option<u64>,
}

/// Parse limit parameters. Legacy parameters fail the whole call.
///
/// `*Kbps` values are in KiB/s; `*Bps` values win when both are given.
pub fn parse_limit_params(params: &HashMap<String, String>) -> FleetResult<BandwidthUpdate> {
    if let Some(legacy) = LEGACY_LIMIT_PARAMS.iter().find(|name| params.contains_key(**name)) {
        return Err(FleetError::validation(*legacy, "no longer supported"));
    }

    let kib = |field: &str| -> FleetResult<Option<u64>> {
        parse_optional(field, params.get(field))?
            .map(|v| {
                v.checked_mul(1024)
                    .ok_or_else(|| FleetError::validation(field, "value too large"))
            })
            .transpose()
    };

    let upstream_kbps = kib("upstreamKbps")?;
    let upstream_bps = parse_optional("upstreamBps", params.get("upstreamBps"))?;
    let downstream_kbps = kib("downstreamKbps")?;
    let downstream_bps = parse_optional("downstreamBps", params.get("downstreamBps"))?;
    let latency_ms = parse_optional("latency", params.get("latency"))?;

    Ok(BandwidthUpdate {
        upstream_bps: upstream_bps.or(upstream_kbps),
        downstream_bps: downstream_bps.or(downstream_kbps),
        latency_ms,
    })
}

/// Parse timeout parameters (milliseconds; `dnsCacheTimeout` in seconds).
pub fn parse_timeout_params(params: &HashMap<String, String>) -> FleetResult<TimeoutUpdate> {
    Ok(TimeoutUpdate {
        request_ms: parse_optional("requestTimeout", params.get("requestTimeout"))?,
        idle_ms: parse_optional("readTimeout", params.get("readTimeout"))?,
        connect_ms: parse_optional("connectionTimeout", params.get("connectionTimeout"))?,
        dns_ttl_secs: parse_optional("dnsCacheTimeout", params.get("dnsCacheTimeout"))?,
    })
}

impl ProxyInstance {
    fn update<F>(&self, change: F) -> FleetResult<()>
    where
        F: FnOnce(&mut crate::settings::InstanceSettings) -> FleetResult<()>,
    {
        let published = self.runtime().settings.update(change)?;
        tracing::debug!(port = self.port(), generation = published.generation, "Settings published");
        Ok(())
    }

    pub fn set_bandwidth(&self, update: BandwidthUpdate) -> FleetResult<()> {
        self.update(|s| {
            if let Some(bps) = update.upstream_bps {
                s.bandwidth.upstream_bps = bps;
            }
            if let Some(bps) = update.downstream_bps {
                s.bandwidth.downstream_bps = bps;
            }
            if let Some(ms) = update.latency_ms {
                s.bandwidth.latency_ms = ms;
            }
            Ok(())
        })
    }

    pub fn set_timeouts(&self, update: TimeoutUpdate) -> FleetResult<()> {
        self.update(|s| {
            if let Some(ms) = update.connect_ms {
                s.timeouts.connect_ms = ms;
            }
            if let Some(ms) = update.request_ms {
                s.timeouts.request_ms = ms;
            }
            if let Some(ms) = update.idle_ms {
                s.timeouts.idle_ms = ms;
            }
            if let Some(secs) = update.dns_ttl_secs {
                s.dns.positive_ttl_secs = secs;
                s.dns.negative_ttl_secs = secs;
            }
            Ok(())
        })
    }

    /// Add a blocklist rule. `url_pattern` and `method_pattern` must match
    /// the whole URL / method.
    pub fn add_blocklist_rule(&self, url_pattern: &str, status: u16, method_pattern: Option<&str>) -> FleetResult<()> {
        let rule = BlocklistRule {
            url_pattern: Pattern::full_match("regex", url_pattern)?,
            status_code: status,
            method_pattern: method_pattern
                .filter(|m| !m.is_empty())
                .map(|m| Pattern::full_match("method", m))
                .transpose()?,
        };
        self.update(move |s| {
            s.blocklist.push(rule);
            Ok(())
        })
    }

    pub fn clear_blocklist(&self) -> FleetResult<()> {
        self.update(|s| {
            s.blocklist.clear();
            Ok(())
        })
    }

    pub fn blocklist(&self) -> Vec<BlocklistRule> {
        self.settings().blocklist.clone()
    }

    /// Replace the allowlist patterns and enable it.
    pub fn set_allowlist<S: AsRef<str>>(&self, patterns: &[S], status: u16) -> FleetResult<()> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::full_match("regex", p.as_ref()))
            .collect::<FleetResult<Vec<_>>>()?;
        self.update(move |s| {
            s.allowlist = Allowlist {
                enabled: true,
                patterns,
                status_code: status,
            };
            Ok(())
        })
    }

    /// Turn the allowlist off. Its patterns are kept.
    pub fn disable_allowlist(&self) -> FleetResult<()> {
        self.update(|s| {
            s.allowlist.enabled = false;
            Ok(())
        })
    }

    pub fn allowlist(&self) -> Allowlist {
        self.settings().allowlist.clone()
    }

    /// Merge header overrides. Later values for the same name win.
    pub fn set_headers(&self, headers: &BTreeMap<String, String>) -> FleetResult<()> {
        let checked = headers
            .iter()
            .map(|(name, value)| header_pair(name, value))
            .collect::<FleetResult<Vec<_>>>()?;
        self.update(move |s| {
            s.headers.extend(checked);
            Ok(())
        })
    }

    pub fn set_basic_auth(&self, domain: &str, username: &str, password: &str) -> FleetResult<()> {
        if domain.trim().is_empty() {
            return Err(FleetError::validation("domain", "must not be empty"));
        }
        let domain = domain.trim().to_ascii_lowercase();
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        self.update(move |s| {
            s.basic_auth.insert(domain, credentials);
            Ok(())
        })
    }

    pub fn add_request_filter(&self, filter: Arc<dyn TrafficFilter>) -> FleetResult<()> {
        self.update(move |s| {
            s.request_filters.push(filter);
            Ok(())
        })
    }

    pub fn add_response_filter(&self, filter: Arc<dyn TrafficFilter>) -> FleetResult<()> {
        self.update(move |s| {
            s.response_filters.push(filter);
            Ok(())
        })
    }

    /// Register a request filter script with the instance's script host.
    pub fn add_request_script(&self, script: String) -> FleetResult<()> {
        let host = Arc::clone(&self.runtime().script_host);
        self.add_request_filter(Arc::new(ScriptFilter::request(script, host)))
    }

    /// Register a response filter script with the instance's script host.
    pub fn add_response_script(&self, script: String) -> FleetResult<()> {
        let host = Arc::clone(&self.runtime().script_host);
        self.add_response_filter(Arc::new(ScriptFilter::response(script, host)))
    }

    pub fn add_rewrite_rule(&self, match_pattern: &str, replacement: &str) -> FleetResult<()> {
        let rule = RewriteRule {
            match_pattern: Pattern::search("matchRegex", match_pattern)?,
            replacement: replacement.to_string(),
        };
        self.update(move |s| {
            s.rewrites.push(rule);
            Ok(())
        })
    }

    pub fn clear_rewrite_rules(&self) -> FleetResult<()> {
        self.update(|s| {
            s.rewrites.clear();
            Ok(())
        })
    }

    /// Point hostnames at other addresses. Both cache TTLs drop to zero and
    /// the cache is cleared, so the next lookup sees the new mapping.
    pub fn remap_hosts(&self, remaps: &BTreeMap<String, String>) -> FleetResult<()> {
        let mut cleaned = BTreeMap::new();
        for (host, target) in remaps {
            let host = host.trim().to_ascii_lowercase();
            let target = target.trim().to_string();
            if host.is_empty() || target.is_empty() {
                return Err(FleetError::validation("hosts", "hostnames and addresses must not be empty"));
            }
            cleaned.insert(host, target);
        }

        self.update(move |s| {
            s.dns.remaps.extend(cleaned);
            s.dns.positive_ttl_secs = 0;
            s.dns.negative_ttl_secs = 0;
            Ok(())
        })?;
        self.clear_dns_cache();
        Ok(())
    }

    pub fn set_dns_ttls(&self, positive_secs: u64, negative_secs: u64) -> FleetResult<()> {
        self.update(|s| {
            s.dns.positive_ttl_secs = positive_secs;
            s.dns.negative_ttl_secs = negative_secs;
            Ok(())
        })
    }

    pub fn clear_dns_cache(&self) {
        self.runtime().resolver.clear_cache();
        tracing::debug!(port = self.port(), "DNS cache cleared");
    }

    pub fn set_capture_types(&self, capture: CaptureTypes) -> FleetResult<()> {
        self.update(move |s| {
            s.capture = capture;
            Ok(())
        })
    }

    /// Set the capture flags and start a new session. Returns the previous one.
    pub fn new_har(
        &self,
        capture: CaptureTypes,
        initial_page_ref: Option<String>,
        initial_page_title: Option<String>,
    ) -> FleetResult<Option<Har>> {
        self.set_capture_types(capture)?;
        Ok(self.recorder().new_har(initial_page_ref, initial_page_title))
    }

    pub fn new_page(&self, page_ref: Option<String>, page_title: Option<String>) -> Option<Har> {
        self.recorder().new_page(page_ref, page_title)
    }

    pub fn end_page(&self) {
        self.recorder().end_page();
    }

    pub fn end_har(&self) -> Option<Har> {
        self.recorder().end_har()
    }

    pub fn har(&self, clean: bool) -> Option<Har> {
        self.recorder().har(clean)
    }

    /// Entries whose URL fully matches `url_pattern`.
    pub fn find_entries(&self, url_pattern: &str) -> FleetResult<Vec<Arc<HarEntry>>> {
        let pattern = Pattern::full_match("urlPattern", url_pattern)?;
        Ok(self
            .recorder()
            .snapshot()
            .map(|log| har::find_entries(&log, &pattern))
            .unwrap_or_default())
    }

    /// Latest entry, optionally restricted to URLs fully matching `url_pattern`.
    pub fn most_recent_entry(&self, url_pattern: Option<&str>) -> FleetResult<Option<Arc<HarEntry>>> {
        let pattern = url_pattern.map(|p| Pattern::full_match("urlPattern", p)).transpose()?;
        let Some(log) = self.recorder().snapshot() else {
            return Ok(None);
        };
        Ok(match pattern {
            Some(pattern) => har::find_most_recent_matching(&log, &pattern),
            None => har::find_most_recent_entry(&log),
        })
    }

    /// Block until the instance's traffic has been quiet for `quiet`.
    pub async fn wait_for_quiescence(&self, quiet: Duration, timeout: Duration) -> FleetResult<()> {
        let result = self.activity().wait_for_quiescence(quiet, timeout).await;
        let label = match &result {
            Ok(()) => "quiet",
            Err(FleetError::TimedOut) => "timed_out",
            Err(_) => "removed",
        };
        metrics::record_quiescence_wait(label);
        tracing::debug!(port = self.port(), quiet_ms = quiet.as_millis() as u64, result = label, "Quiescence wait finished");
        result
    }
}
