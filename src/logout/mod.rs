// Logout propagation across surfaces
//
// A sign-out stamps a timestamp into a cookie scoped to the parent domain.
// Every surface polls that cookie and reacts to a stamp newer than the last
// one it has seen.

mod cookie;
mod watcher;

pub use cookie::{Cookie, DomainCookieJar, SameSite};
pub use watcher::{LogoutWatcher, WatchOutcome, WatcherHandle, LOGOUT_SEEN_KEY};

use std::sync::Arc;

use crate::storage::StorageError;

/// Name of the shared logout cookie
pub const LOGOUT_COOKIE_NAME: &str = "memoria_logout";

/// Default cookie lifetime: 24 hours
pub const LOGOUT_COOKIE_MAX_AGE_SECS: i64 = 86_400;

/// "A sign-out happened at `timestamp`" (Unix milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogoutSignal {
    pub timestamp: i64,
}

/// Current time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Writes and reads the shared logout cookie
pub struct LogoutBroadcaster {
    jar: Arc<DomainCookieJar>,
    cookie_name: String,
    max_age_secs: i64,
}

impl LogoutBroadcaster {
    pub fn new(jar: Arc<DomainCookieJar>) -> Self {
        Self {
            jar,
            cookie_name: LOGOUT_COOKIE_NAME.to_string(),
            max_age_secs: LOGOUT_COOKIE_MAX_AGE_SECS,
        }
    }

    pub fn with_max_age(mut self, max_age_secs: i64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Stamp a logout now
    pub fn signal(&self) -> Result<LogoutSignal, StorageError> {
        self.signal_at(now_millis())
    }

    /// Stamp a logout at `now_ms`.
    ///
    /// The written stamp is always greater than the one already present, so
    /// back-to-back sign-outs stay distinct events.
    pub fn signal_at(&self, now_ms: i64) -> Result<LogoutSignal, StorageError> {
        let timestamp = match self.read_at(now_ms)? {
            Some(current) if current.timestamp >= now_ms => current.timestamp + 1,
            _ => now_ms,
        };

        let cookie = Cookie::new(&self.cookie_name, timestamp.to_string())
            .with_domain(self.jar.domain())
            .with_max_age(self.max_age_secs)
            .with_same_site(SameSite::Lax);
        self.jar.set(&cookie, now_ms)?;

        tracing::info!(timestamp, "Logout signal stamped");
        Ok(LogoutSignal { timestamp })
    }

    /// Latest stamp, if the cookie exists and holds a valid number
    pub fn read(&self) -> Result<Option<LogoutSignal>, StorageError> {
        self.read_at(now_millis())
    }

    pub fn read_at(&self, now_ms: i64) -> Result<Option<LogoutSignal>, StorageError> {
        let value = self.jar.get(&self.cookie_name, now_ms)?;
        Ok(value
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|ts| *ts > 0)
            .map(|timestamp| LogoutSignal { timestamp }))
    }

    /// `Set-Cookie` header value for a stamp, for surfaces that write cookies themselves
    pub fn header_value(&self, signal: LogoutSignal) -> String {
        Cookie::new(&self.cookie_name, signal.timestamp.to_string())
            .with_domain(self.jar.domain())
            .with_max_age(self.max_age_secs)
            .with_same_site(SameSite::Lax)
            .to_header_value()
    }
}
