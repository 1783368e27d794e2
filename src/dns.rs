//! Per-instance host resolution with remapping and a TTL cache.
//!
//! # Data Flow
//! ```text
//! resolve(host)
//!     → remap table (settings snapshot): literal IP returns directly,
//!       a hostname replaces the lookup target
//!     → cache hit (not expired) → cached addresses or cached failure
//!     → expired hit is evicted
//!     → tokio::net::lookup_host → sweep expired entries, cache for the
//!       positive / negative TTL
//! ```

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::settings::DnsSettings;

/// Lookup failure. Cached for the negative TTL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("failed to resolve {host}: {reason}")]
    Lookup { host: String, reason: String },

    #[error("{0} resolved to no addresses")]
    NoAddresses(String),
}

#[derive(Debug, Clone)]
enum Cached {
    Resolved(Vec<IpAddr>),
    Failed(ResolveError),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Cached,
    expires_at: Instant,
}

/// Resolution cache for one proxy instance.
///
/// The remap table and TTLs are read from the settings snapshot passed to
/// [`resolve`](Self::resolve), so a DNS change is published together with
/// every other setting.
#[derive(Debug, Default)]
pub struct HostResolver {
    cache: DashMap<String, CacheEntry>,
}

impl HostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `host` under `dns`.
    pub async fn resolve(&self, host: &str, dns: &DnsSettings) -> Result<Vec<IpAddr>, ResolveError> {
        let key = host.to_ascii_lowercase();

        let target = match dns.remaps.get(&key) {
            Some(mapped) => {
                if let Ok(ip) = mapped.parse::<IpAddr>() {
                    return Ok(vec![ip]);
                }
                mapped.to_ascii_lowercase()
            }
            None => key,
        };

        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let now = Instant::now();
        if let Some(entry) = self.cache.get(&target) {
            if entry.expires_at > now {
                tracing::trace!(host = %target, "DNS cache hit");
                return match &entry.value {
                    Cached::Resolved(addrs) => Ok(addrs.clone()),
                    Cached::Failed(err) => Err(err.clone()),
                };
            }
        }
        self.cache.remove_if(&target, |_, entry| entry.expires_at <= now);

        let result = lookup(&target).await;
        let ttl = match &result {
            Ok(_) => dns.positive_ttl_secs,
            Err(_) => dns.negative_ttl_secs,
        };
        if ttl > 0 {
            let value = match &result {
                Ok(addrs) => Cached::Resolved(addrs.clone()),
                Err(err) => Cached::Failed(err.clone()),
            };
            let now = Instant::now();
            self.cache.retain(|_, entry| entry.expires_at > now);
            self.cache.insert(
                target,
                CacheEntry {
                    value,
                    expires_at: now + Duration::from_secs(ttl),
                },
            );
        }
        result
    }

    /// Drop every cached resolution.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached hosts. Expired entries stay until the next lookup
    /// touches the cache.
    pub fn cached_hosts(&self) -> usize {
        self.cache.len()
    }
}

async fn lookup(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ResolveError::Lookup {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
    ips.dedup();
    if ips.is_empty() {
        return Err(ResolveError::NoAddresses(host.to_string()));
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dns(positive: u64, negative: u64) -> DnsSettings {
        DnsSettings {
            remaps: BTreeMap::new(),
            positive_ttl_secs: positive,
            negative_ttl_secs: negative,
        }
    }

    #[tokio::test]
    async fn test_remap_to_literal_skips_lookup_and_cache() {
        let resolver = HostResolver::new();
        let mut settings = dns(60, 10);
        settings.remaps.insert("example.test".into(), "10.1.2.3".into());

        let addrs = resolver.resolve("Example.TEST", &settings).await.unwrap();
        assert_eq!(addrs, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.cached_hosts(), 0);
    }

    #[tokio::test]
    async fn test_literal_host_is_returned_as_is() {
        let resolver = HostResolver::new();
        let addrs = resolver.resolve("127.0.0.1", &dns(60, 10)).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_successful_lookup_is_cached_until_cleared() {
        let resolver = HostResolver::new();
        resolver.resolve("localhost", &dns(60, 10)).await.unwrap();
        assert_eq!(resolver.cached_hosts(), 1);

        resolver.clear_cache();
        assert_eq!(resolver.cached_hosts(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_caching() {
        let resolver = HostResolver::new();
        resolver.resolve("localhost", &dns(0, 0)).await.unwrap();
        assert_eq!(resolver.cached_hosts(), 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted() {
        let resolver = HostResolver::new();
        let stale = CacheEntry {
            value: Cached::Resolved(vec!["10.0.0.1".parse().unwrap()]),
            expires_at: Instant::now(),
        };
        resolver.cache.insert("localhost".into(), stale.clone());
        resolver.cache.insert("gone-a.test".into(), stale.clone());
        resolver.cache.insert("gone-b.test".into(), stale);

        // A zero TTL means the fresh result is not cached either.
        let addrs = resolver.resolve("localhost", &dns(0, 0)).await.unwrap();
        assert!(!addrs.contains(&"10.0.0.1".parse().unwrap()));
        assert!(!resolver.cache.contains_key("localhost"));
        assert_eq!(resolver.cached_hosts(), 2);

        // Caching a new result sweeps the rest.
        resolver.resolve("localhost", &dns(60, 0)).await.unwrap();
        assert_eq!(resolver.cached_hosts(), 1);
        assert!(resolver.cache.contains_key("localhost"));
    }

    #[tokio::test]
    async fn test_failures_use_negative_ttl() {
        let resolver = HostResolver::new();
        let err = resolver.resolve("no-such-host.invalid", &dns(0, 30)).await;
        assert!(err.is_err());
        assert_eq!(resolver.cached_hosts(), 1);

        // Served from the cache the second time.
        let again = resolver.resolve("no-such-host.invalid", &dns(0, 30)).await;
        assert_eq!(err, again);
    }
}
