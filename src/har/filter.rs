//! Queries over a session log snapshot.
//!
//! All functions take a borrowed [`HarLog`] that the caller obtained from
//! the recorder. Snapshots are immutable, so a query never blocks the
//! traffic path and never sees an entry appear half-way through.

use std::sync::Arc;

use crate::har::model::{HarEntry, HarLog};
use crate::pattern::Pattern;

/// Entry with the latest `startedDateTime`.
///
/// When several entries share the latest timestamp, the one recorded first
/// wins.
pub fn find_most_recent_entry(log: &HarLog) -> Option<Arc<HarEntry>> {
    most_recent(log.entries.iter())
}

/// Entries whose request URL fully matches `pattern`, in recording order.
pub fn find_entries(log: &HarLog, pattern: &Pattern) -> Vec<Arc<HarEntry>> {
    matching(log, pattern).cloned().collect()
}

/// Latest entry among those whose request URL fully matches `pattern`.
pub fn find_most_recent_matching(log: &HarLog, pattern: &Pattern) -> Option<Arc<HarEntry>> {
    most_recent(matching(log, pattern))
}

fn matching<'a>(log: &'a HarLog, pattern: &'a Pattern) -> impl Iterator<Item = &'a Arc<HarEntry>> + 'a {
    log.entries.iter().filter(move |e| pattern.is_match(&e.request.url))
}

fn most_recent<'a>(entries: impl Iterator<Item = &'a Arc<HarEntry>>) -> Option<Arc<HarEntry>> {
    // Strictly later replaces, so the first of equal maxima is kept.
    entries
        .reduce(|best, e| if e.started_date_time > best.started_date_time { e } else { best })
        .cloned()
}
