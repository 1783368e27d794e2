//! Live session log for one proxy instance.
//!
//! Writers (the engine appending entries, control calls managing pages)
//! mutate the session in place under the recorder's lock. Readers get an
//! immutable [`HarLog`] snapshot. A snapshot is built at most once per
//! change and then served with a single atomic load until the next write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use chrono::Utc;

use crate::har::model::{Har, HarEntry, HarLog, HarPage};

#[derive(Debug, Default)]
struct Session {
    pages: Vec<HarPage>,
    entries: Vec<Arc<HarEntry>>,
    /// Number of pages started in the current session.
    started: usize,
}

impl Session {
    fn to_log(&self) -> HarLog {
        HarLog {
            pages: self.pages.clone(),
            entries: self.entries.clone(),
            ..HarLog::new()
        }
    }

    /// Returns whether a page was actually closed.
    fn close_current_page(&mut self) -> bool {
        match self.pages.last_mut() {
            Some(page) if page.ended_date_time.is_none() => {
                page.ended_date_time = Some(Utc::now());
                true
            }
            _ => false,
        }
    }
}

/// Session recorder. Shared by the engine and the control plane.
#[derive(Debug, Default)]
pub struct SessionRecorder {
    session: Mutex<Option<Session>>,
    /// Last built snapshot; cleared by every write.
    published: ArcSwapOption<HarLog>,
    /// Only written with `session` locked.
    capturing: AtomicBool,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether entries are currently being recorded.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    /// Current session log snapshot, if a session was ever started.
    pub fn snapshot(&self) -> Option<Arc<HarLog>> {
        if let Some(log) = self.published.load_full() {
            return Some(log);
        }
        let session = self.session.lock().expect("recorder session mutex poisoned");
        self.publish(&session)
    }

    /// Build (or reuse) the snapshot for `session`. Caller holds the lock.
    fn publish(&self, session: &Option<Session>) -> Option<Arc<HarLog>> {
        if let Some(log) = self.published.load_full() {
            return Some(log);
        }
        let log = Arc::new(session.as_ref()?.to_log());
        self.published.store(Some(Arc::clone(&log)));
        Some(log)
    }

    /// Start a new session with one open page. Returns the previous session.
    pub fn new_har(&self, initial_page_ref: Option<String>, initial_page_title: Option<String>) -> Option<Har> {
        let mut session = self.session.lock().expect("recorder session mutex poisoned");
        let previous = self.publish(&session);

        let id = initial_page_ref.unwrap_or_else(|| "Page 0".to_string());
        let title = initial_page_title.unwrap_or_else(|| id.clone());
        *session = Some(Session {
            pages: vec![HarPage {
                id,
                title,
                started_date_time: Utc::now(),
                ended_date_time: None,
            }],
            entries: Vec::new(),
            started: 1,
        });
        self.published.store(None);
        self.capturing.store(true, Ordering::Release);
        previous.map(|log| Har { log })
    }

    /// End the current page and open a new one. Returns the session as it
    /// was before the new page, or `None` when no session is running.
    pub fn new_page(&self, page_ref: Option<String>, page_title: Option<String>) -> Option<Har> {
        let mut guard = self.session.lock().expect("recorder session mutex poisoned");
        let before = self.publish(&guard)?;
        let session = guard.as_mut()?;

        let id = page_ref.unwrap_or_else(|| format!("Page {}", session.started));
        let title = page_title.unwrap_or_else(|| id.clone());
        session.close_current_page();
        session.pages.push(HarPage {
            id,
            title,
            started_date_time: Utc::now(),
            ended_date_time: None,
        });
        session.started += 1;
        self.published.store(None);

        Some(Har { log: before })
    }

    /// Stamp `endedDateTime` on the current page.
    pub fn end_page(&self) {
        let mut guard = self.session.lock().expect("recorder session mutex poisoned");
        if guard.as_mut().is_some_and(Session::close_current_page) {
            self.published.store(None);
        }
    }

    /// End the current page and stop capturing. Returns the final session;
    /// nothing is appended to it afterwards.
    pub fn end_har(&self) -> Option<Har> {
        let mut guard = self.session.lock().expect("recorder session mutex poisoned");
        self.capturing.store(false, Ordering::Release);
        if guard.as_mut().is_some_and(Session::close_current_page) {
            self.published.store(None);
        }
        self.publish(&guard).map(|log| Har { log })
    }

    /// Snapshot of the session. With `clean`, captured entries are dropped
    /// after the snapshot is taken; pages are kept.
    pub fn har(&self, clean: bool) -> Option<Har> {
        if !clean {
            return self.snapshot().map(|log| Har { log });
        }

        let mut guard = self.session.lock().expect("recorder session mutex poisoned");
        let current = self.publish(&guard)?;
        if let Some(session) = guard.as_mut() {
            session.entries.clear();
        }
        self.published.store(None);
        Some(Har { log: current })
    }

    /// Append an entry, tagged with the current page. Dropped unless capturing.
    pub fn record(&self, mut entry: HarEntry) -> bool {
        if !self.is_capturing() {
            return false;
        }

        let mut guard = self.session.lock().expect("recorder session mutex poisoned");
        // end_har may have run while this request waited for the lock.
        if !self.is_capturing() {
            return false;
        }
        let Some(session) = guard.as_mut() else {
            return false;
        };

        entry.pageref = session.pages.last().map(|p| p.id.clone());
        session.entries.push(Arc::new(entry));
        self.published.store(None);
        true
    }
}
