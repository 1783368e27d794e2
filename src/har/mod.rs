//! Session log (HAR) subsystem.
//!
//! # Data Flow
//! ```text
//! engine, per completed exchange
//!     → recorder.rs (append under writer lock, publish new log)
//!
//! control API
//!     → recorder.rs (new session, pages, snapshot)
//!     → filter.rs (find entries by URL pattern / recency on a snapshot)
//! ```

pub mod filter;
pub mod model;
pub mod recorder;

pub use filter::{find_entries, find_most_recent_entry, find_most_recent_matching};
pub use model::{Har, HarContent, HarEntry, HarLog, HarNameValue, HarPage, HarPostData, HarRequest, HarResponse};
pub use recorder::SessionRecorder;

use url::Url;

/// Canonical form used for recorded and matched URLs:
/// `scheme://host[:port]/path[?query]`, default port and fragment dropped.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    // `Url` already omits the scheme's default port when serializing.
    normalized.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        normalize_url(&Url::parse(raw).unwrap())
    }

    #[test]
    fn test_normalize_drops_default_port_and_fragment() {
        assert_eq!(norm("http://a.com:80/x#frag"), "http://a.com/x");
        assert_eq!(norm("https://a.com:443/x?q=1"), "https://a.com/x?q=1");
        assert_eq!(norm("http://a.com:8080/x"), "http://a.com:8080/x");
    }

    #[test]
    fn test_normalize_adds_root_path() {
        assert_eq!(norm("http://A.com"), "http://a.com/");
    }
}
