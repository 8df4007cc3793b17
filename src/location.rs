// Page location abstraction
// What a surface can do with its address bar: read it, rewrite it in place,
// or leave for another URL

use std::sync::{Mutex, PoisonError};
use url::Url;

/// The current page's address
pub trait Location: Send + Sync {
    /// Full current URL
    fn href(&self) -> Url;

    /// Rewrite the address bar without reloading (history replace)
    fn replace_history(&self, url: &Url);

    /// Leave the page for `url`, replacing the current history entry
    fn navigate(&self, url: &str);
}

/// How the page was last changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationChange {
    HistoryReplaced(String),
    Navigated(String),
}

/// In-memory location that records every change
#[derive(Debug)]
pub struct PageLocation {
    current: Mutex<Url>,
    changes: Mutex<Vec<LocationChange>>,
}

impl PageLocation {
    pub fn new(url: Url) -> Self {
        Self {
            current: Mutex::new(url),
            changes: Mutex::new(Vec::new()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(raw)?))
    }

    /// Every change in order
    pub fn changes(&self) -> Vec<LocationChange> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forced navigations only
    pub fn navigations(&self) -> Vec<String> {
        self.changes()
            .into_iter()
            .filter_map(|change| match change {
                LocationChange::Navigated(url) => Some(url),
                LocationChange::HistoryReplaced(_) => None,
            })
            .collect()
    }

    fn record(&self, change: LocationChange) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }
}

impl Location for PageLocation {
    fn href(&self) -> Url {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_history(&self, url: &Url) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = url.clone();
        self.record(LocationChange::HistoryReplaced(url.to_string()));
    }

    fn navigate(&self, url: &str) {
        // A navigation to a relative or unparsable target keeps the old address
        if let Ok(parsed) = Url::parse(url) {
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = parsed;
        }
        self.record(LocationChange::Navigated(url.to_string()));
    }
}
