//! Traffic policy: what a settings snapshot says to do with one request.
//!
//! Everything here is pure over an [`InstanceSettings`] snapshot, so the
//! engine and tests can evaluate a request without any network I/O.
//!
//! # Evaluation order
//! ```text
//! normalized URL
//!     → blocklist (first matching rule answers)
//!     → allowlist (enabled and nothing matches → answer)
//!     → rewrite rules, in registration order
//!     → basic auth for the (rewritten) host
//!     → header overrides (win over basic auth)
//!     → Dispatch
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::filter::{FilterRequest, FilterResponse, TrafficFilter};
use crate::settings::InstanceSettings;

/// Why a request was answered locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    Blocklisted,
    NotAllowlisted,
}

impl ShortCircuit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortCircuit::Blocklisted => "blocklisted",
            ShortCircuit::NotAllowlisted => "not_allowlisted",
        }
    }
}

/// A request that should go upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// URL after rewrite rules.
    pub url: String,
    /// Lowercased header name → value to set on the outgoing request.
    pub extra_headers: BTreeMap<String, String>,
}

/// Outcome of evaluating a request against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Respond { status: u16, reason: ShortCircuit },
    Dispatch(Dispatch),
}

/// Evaluate `method url` (normalized) against `settings`.
pub fn evaluate(settings: &InstanceSettings, method: &str, url: &str) -> Verdict {
    if let Some(rule) = settings.blocklist.iter().find(|r| r.matches(method, url)) {
        return Verdict::Respond {
            status: rule.status_code,
            reason: ShortCircuit::Blocklisted,
        };
    }

    if let Some(status) = settings.allowlist.rejects(url) {
        return Verdict::Respond {
            status,
            reason: ShortCircuit::NotAllowlisted,
        };
    }

    let url = settings
        .rewrites
        .iter()
        .fold(url.to_string(), |current, rule| rule.apply(&current));

    let mut extra_headers = BTreeMap::new();
    if let Some(credentials) = host_of(&url).and_then(|host| settings.basic_auth.get(&host)) {
        extra_headers.insert("authorization".to_string(), format!("Basic {}", credentials));
    }
    for (name, value) in &settings.headers {
        extra_headers.insert(name.clone(), value.clone());
    }

    Verdict::Dispatch(Dispatch { url, extra_headers })
}

/// Run request filters in order. The first filter that answers stops the chain.
pub fn apply_request_filters(
    filters: &[Arc<dyn TrafficFilter>],
    request: &mut FilterRequest,
) -> Option<FilterResponse> {
    filters.iter().find_map(|f| f.apply_to_request(request))
}

/// Run response filters in order.
pub fn apply_response_filters(
    filters: &[Arc<dyn TrafficFilter>],
    request: &FilterRequest,
    response: &mut FilterResponse,
) {
    for filter in filters {
        filter.apply_to_response(request, response);
    }
}

/// Time it takes to move `bytes` at `bytes_per_second`. Zero rate means unlimited.
pub fn transfer_delay(bytes: usize, bytes_per_second: u64) -> Duration {
    if bytes_per_second == 0 || bytes == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(bytes as f64 / bytes_per_second as f64)
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceDefaults;
    use crate::filter::NativeFilter;
    use crate::pattern::Pattern;
    use crate::settings::{BlocklistRule, RewriteRule};
    use axum::http::HeaderMap;
    use bytes::Bytes;

    fn settings() -> InstanceSettings {
        InstanceSettings::from_defaults(&InstanceDefaults::default())
    }

    fn dispatch(verdict: Verdict) -> Dispatch {
        match verdict {
            Verdict::Dispatch(d) => d,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn test_untouched_request_dispatches_as_is() {
        let d = dispatch(evaluate(&settings(), "GET", "http://a.com/"));
        assert_eq!(d.url, "http://a.com/");
        assert!(d.extra_headers.is_empty());
    }

    #[test]
    fn test_blocklist_answers_before_allowlist() {
        let mut s = settings();
        s.blocklist.push(BlocklistRule {
            url_pattern: Pattern::full_match("regex", r"^http://x\.com/.*$").unwrap(),
            status_code: 403,
            method_pattern: None,
        });
        s.allowlist.enabled = true;
        s.allowlist.status_code = 404;

        assert_eq!(
            evaluate(&s, "GET", "http://x.com/page"),
            Verdict::Respond {
                status: 403,
                reason: ShortCircuit::Blocklisted
            }
        );
        assert_eq!(
            evaluate(&s, "GET", "http://y.com/page"),
            Verdict::Respond {
                status: 404,
                reason: ShortCircuit::NotAllowlisted
            }
        );
    }

    #[test]
    fn test_first_matching_block_rule_wins() {
        let mut s = settings();
        for status in [410, 418] {
            s.blocklist.push(BlocklistRule {
                url_pattern: Pattern::full_match("regex", r"http://x\.com/.*").unwrap(),
                status_code: status,
                method_pattern: None,
            });
        }
        assert!(matches!(evaluate(&s, "GET", "http://x.com/a"), Verdict::Respond { status: 410, .. }));
    }

    #[test]
    fn test_rewrites_apply_in_order() {
        let mut s = settings();
        s.rewrites.push(RewriteRule {
            match_pattern: Pattern::search("matchRegex", "alpha").unwrap(),
            replacement: "beta".into(),
        });
        s.rewrites.push(RewriteRule {
            match_pattern: Pattern::search("matchRegex", "beta").unwrap(),
            replacement: "gamma".into(),
        });

        let d = dispatch(evaluate(&s, "GET", "http://a.com/alpha"));
        assert_eq!(d.url, "http://a.com/gamma");
    }

    #[test]
    fn test_basic_auth_follows_rewritten_host() {
        let mut s = settings();
        s.basic_auth.insert("b.com".into(), "dTpw".into());
        s.rewrites.push(RewriteRule {
            match_pattern: Pattern::search("matchRegex", r"a\.com").unwrap(),
            replacement: "b.com".into(),
        });

        let d = dispatch(evaluate(&s, "GET", "http://a.com/"));
        assert_eq!(d.extra_headers.get("authorization").unwrap(), "Basic dTpw");
    }

    #[test]
    fn test_header_override_wins_over_basic_auth() {
        let mut s = settings();
        s.basic_auth.insert("a.com".into(), "dTpw".into());
        s.headers.insert("authorization".into(), "Bearer t".into());
        s.headers.insert("x-test".into(), "1".into());

        let d = dispatch(evaluate(&s, "GET", "http://a.com/"));
        assert_eq!(d.extra_headers.get("authorization").unwrap(), "Bearer t");
        assert_eq!(d.extra_headers.get("x-test").unwrap(), "1");
    }

    #[test]
    fn test_request_filter_chain_stops_at_first_answer() {
        let tag = Arc::new(NativeFilter::on_request("tag", |req: &mut FilterRequest| {
            req.url.push_str("?tagged");
            None
        })) as Arc<dyn TrafficFilter>;
        let deny = Arc::new(NativeFilter::on_request("deny", |_: &mut FilterRequest| {
            Some(FilterResponse::new(451, "no"))
        })) as Arc<dyn TrafficFilter>;
        let never = Arc::new(NativeFilter::on_request("never", |req: &mut FilterRequest| {
            req.url.push_str("&never");
            None
        })) as Arc<dyn TrafficFilter>;

        let mut req = FilterRequest {
            method: "GET".into(),
            url: "http://a.com/".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let answer = apply_request_filters(&[tag, deny, never], &mut req).unwrap();
        assert_eq!(answer.status, 451);
        assert_eq!(req.url, "http://a.com/?tagged");
    }

    #[test]
    fn test_transfer_delay() {
        assert_eq!(transfer_delay(1024, 0), Duration::ZERO);
        assert_eq!(transfer_delay(2048, 1024), Duration::from_secs(2));
        assert_eq!(transfer_delay(512, 1024), Duration::from_millis(500));
    }
}
