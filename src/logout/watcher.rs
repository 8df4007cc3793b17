// Logout watcher
// Polls the shared signal and signs this surface out when a newer stamp appears

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::LogoutBroadcaster;
use crate::auth::TokenStore;
use crate::back_path::{path_and_query, BackPathResolver};
use crate::events::{EventBus, SessionEvent};
use crate::location::Location;
use crate::storage::{Storage, StorageError};
use crate::surface::Surface;

/// Origin-local key holding the last stamp this surface reacted to
pub const LOGOUT_SEEN_KEY: &str = "memoria_logout_seen";

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// No logout cookie present
    NoSignal,
    /// The stamp is not newer than the watermark
    AlreadySeen,
    /// Signal or watermark storage could not be read
    Unavailable,
    /// A new sign-out was observed and applied
    LoggedOut {
        timestamp: i64,
        redirect: Option<String>,
    },
}

/// Per-surface watcher for the shared logout signal
pub struct LogoutWatcher {
    signal: Arc<LogoutBroadcaster>,
    local: Arc<dyn Storage>,
    store: TokenStore,
    location: Arc<dyn Location>,
    resolver: BackPathResolver,
    surface: Surface,
    events: EventBus,
    /// In-memory copy of the watermark, in case the local write fails
    last_seen: AtomicI64,
    /// Set once the first check has looked for a persisted watermark
    primed: AtomicBool,
}

impl LogoutWatcher {
    pub fn new(
        signal: Arc<LogoutBroadcaster>,
        local: Arc<dyn Storage>,
        store: TokenStore,
        location: Arc<dyn Location>,
        resolver: BackPathResolver,
        surface: Surface,
        events: EventBus,
    ) -> Self {
        Self {
            signal,
            local,
            store,
            location,
            resolver,
            surface,
            events,
            last_seen: AtomicI64::new(0),
            primed: AtomicBool::new(false),
        }
    }

    /// Last stamp this surface has reacted to
    pub fn watermark(&self) -> Option<i64> {
        let stored = match self.stored_watermark() {
            Ok(value) => value.unwrap_or(0),
            Err(e) => {
                tracing::debug!(error = %e, "Logout watermark unreadable");
                return None;
            }
        };
        Some(stored.max(self.last_seen.load(Ordering::SeqCst)))
    }

    fn stored_watermark(&self) -> Result<Option<i64>, StorageError> {
        Ok(self
            .local
            .get(LOGOUT_SEEN_KEY)?
            .and_then(|v| v.trim().parse::<i64>().ok()))
    }

    /// Treat the current shared stamp as already handled.
    /// Called after tokens arrive through a sign-in or a handoff.
    pub fn acknowledge_current(&self) -> Option<i64> {
        match self.signal.read() {
            Ok(Some(signal)) => {
                self.record_seen(signal.timestamp);
                Some(signal.timestamp)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Logout signal unreadable");
                None
            }
        }
    }

    /// Advance the watermark; never moves it backwards
    pub fn record_seen(&self, timestamp: i64) {
        if self.last_seen.fetch_max(timestamp, Ordering::SeqCst) >= timestamp {
            return;
        }
        if let Err(e) = self.local.set(LOGOUT_SEEN_KEY, &timestamp.to_string()) {
            tracing::warn!(error = %e, "Failed to persist logout watermark");
        }
    }

    /// Compare the shared stamp with the watermark and react if it is newer
    pub fn check(&self) -> WatchOutcome {
        let signal = match self.signal.read() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!(error = %e, "Logout signal unreadable");
                return WatchOutcome::Unavailable;
            }
        };

        // First visit: a stamp left by an earlier sign-out is the baseline
        if !self.primed.swap(true, Ordering::SeqCst) {
            match self.stored_watermark() {
                Ok(None) if self.last_seen.load(Ordering::SeqCst) == 0 => {
                    let baseline = signal.as_ref().map_or(0, |s| s.timestamp);
                    self.seed_watermark(baseline);
                    return match signal {
                        Some(_) => WatchOutcome::AlreadySeen,
                        None => WatchOutcome::NoSignal,
                    };
                }
                Ok(_) => {}
                Err(_) => self.primed.store(false, Ordering::SeqCst),
            }
        }

        let Some(signal) = signal else {
            return WatchOutcome::NoSignal;
        };

        let Some(seen) = self.watermark() else {
            return WatchOutcome::Unavailable;
        };
        if signal.timestamp <= seen {
            return WatchOutcome::AlreadySeen;
        }

        self.record_seen(signal.timestamp);
        self.store.clear();
        tracing::info!(
            surface = %self.surface,
            timestamp = signal.timestamp,
            "Observed logout from another surface"
        );
        self.events.publish(SessionEvent::LogoutObserved {
            surface: self.surface,
            timestamp: signal.timestamp,
        });

        let redirect = self.login_redirect();
        if let Some(ref url) = redirect {
            self.location.navigate(url);
        }

        WatchOutcome::LoggedOut {
            timestamp: signal.timestamp,
            redirect,
        }
    }

    fn seed_watermark(&self, baseline: i64) {
        self.last_seen.fetch_max(baseline, Ordering::SeqCst);
        tracing::debug!(surface = %self.surface, baseline, "Seeding logout watermark");
        if let Err(e) = self.local.set(LOGOUT_SEEN_KEY, &baseline.to_string()) {
            tracing::warn!(error = %e, "Failed to persist logout watermark");
        }
    }

    /// Login URL to navigate to, or `None` when already on the login page
    fn login_redirect(&self) -> Option<String> {
        let href = self.location.href();
        if self.surface == Surface::Auth && href.path().starts_with("/login") {
            return None;
        }
        Some(
            self.resolver
                .build_login_url_for(self.surface, &path_and_query(&href)),
        )
    }

    /// Poll on `interval` until the handle is stopped or dropped.
    /// The first check runs immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> WatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.check();
                    }
                }
            }
            tracing::debug!(surface = %self.surface, "Logout watcher stopped");
        });

        WatcherHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Owns the polling task; dropping it cancels the task
pub struct WatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Stop polling and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenPair;
    use crate::location::PageLocation;
    use crate::logout::DomainCookieJar;
    use crate::storage::{DisabledStorage, MemoryStorage};
    use crate::surface::Surfaces;

    struct Fixture {
        broadcaster: Arc<LogoutBroadcaster>,
        store: TokenStore,
        location: Arc<PageLocation>,
        watcher: Arc<LogoutWatcher>,
    }

    /// Watcher that has not run its first check yet
    fn unmounted(surface: Surface, href: &str) -> Fixture {
        let cookies = Arc::new(DomainCookieJar::new(
            Arc::new(MemoryStorage::new()),
            "localhost",
        ));
        let broadcaster = Arc::new(LogoutBroadcaster::new(cookies));
        let store = TokenStore::new(Arc::new(MemoryStorage::new()));
        store.set(&TokenPair::new("T1", Some("R1".to_string())));
        let location = Arc::new(PageLocation::parse(href).unwrap());
        let watcher = Arc::new(LogoutWatcher::new(
            broadcaster.clone(),
            Arc::new(MemoryStorage::new()),
            store.clone(),
            location.clone(),
            BackPathResolver::new(Surfaces::default()),
            surface,
            EventBus::new(),
        ));
        Fixture {
            broadcaster,
            store,
            location,
            watcher,
        }
    }

    fn fixture(surface: Surface, href: &str) -> Fixture {
        let f = unmounted(surface, href);
        assert_eq!(f.watcher.check(), WatchOutcome::NoSignal);
        f
    }

    #[test]
    fn test_no_signal_is_noop() {
        let f = fixture(Surface::App, "http://localhost:3000/trips");
        assert_eq!(f.watcher.check(), WatchOutcome::NoSignal);
        assert!(f.store.get().is_some());
    }

    #[test]
    fn test_new_signal_clears_and_redirects() {
        let f = fixture(Surface::App, "http://localhost:3000/trips?year=2024");
        let signal = f.broadcaster.signal().unwrap();

        let outcome = f.watcher.check();
        assert_eq!(
            outcome,
            WatchOutcome::LoggedOut {
                timestamp: signal.timestamp,
                redirect: Some(
                    "http://localhost:3001/login?back-path=%2Ftrips%3Fyear%3D2024".to_string()
                ),
            }
        );
        assert_eq!(f.store.get(), None);
        assert_eq!(f.watcher.watermark(), Some(signal.timestamp));
        assert_eq!(f.location.navigations().len(), 1);
    }

    #[test]
    fn test_reacts_once_per_stamp() {
        let f = fixture(Surface::App, "http://localhost:3000/");
        let signal = f.broadcaster.signal().unwrap();
        assert!(matches!(f.watcher.check(), WatchOutcome::LoggedOut { .. }));

        f.store.set(&TokenPair::new("T2", None));
        assert_eq!(f.watcher.check(), WatchOutcome::AlreadySeen);
        assert!(f.store.get().is_some());

        // An older stamp never triggers either
        f.watcher.record_seen(signal.timestamp + 10);
        f.broadcaster.signal_at(signal.timestamp + 5).unwrap();
        assert_eq!(f.watcher.check(), WatchOutcome::AlreadySeen);
    }

    #[test]
    fn test_two_quick_signals_react_to_newest_only() {
        let f = fixture(Surface::Admin, "http://localhost:3002/users");
        f.broadcaster.signal().unwrap();
        let newest = f.broadcaster.signal().unwrap();

        match f.watcher.check() {
            WatchOutcome::LoggedOut { timestamp, .. } => assert_eq!(timestamp, newest.timestamp),
            other => panic!("expected logout, got {:?}", other),
        }
        assert_eq!(f.watcher.check(), WatchOutcome::AlreadySeen);
        assert_eq!(f.location.navigations().len(), 1);
    }

    #[test]
    fn test_admin_redirect_carries_absolute_back_path() {
        let f = fixture(Surface::Admin, "http://localhost:3002/users");
        f.broadcaster.signal().unwrap();
        f.watcher.check();
        assert_eq!(
            f.location.navigations(),
            vec!["http://localhost:3001/login?back-path=http%3A%2F%2Flocalhost%3A3002%2Fusers"]
        );
    }

    #[test]
    fn test_login_page_does_not_navigate() {
        let f = fixture(Surface::Auth, "http://localhost:3001/login?back-path=%2Ftrips");
        f.broadcaster.signal().unwrap();

        match f.watcher.check() {
            WatchOutcome::LoggedOut { redirect, .. } => assert_eq!(redirect, None),
            other => panic!("expected logout, got {:?}", other),
        }
        assert!(f.location.navigations().is_empty());
        assert_eq!(f.store.get(), None);
    }

    #[test]
    fn test_first_visit_does_not_replay_old_signal() {
        let f = unmounted(Surface::App, "http://localhost:3000/trips");
        let old = f.broadcaster.signal().unwrap();

        assert_eq!(f.watcher.check(), WatchOutcome::AlreadySeen);
        assert!(f.store.get().is_some());
        assert!(f.location.navigations().is_empty());
        assert_eq!(f.watcher.watermark(), Some(old.timestamp));

        f.broadcaster.signal_at(old.timestamp + 1).unwrap();
        assert!(matches!(f.watcher.check(), WatchOutcome::LoggedOut { .. }));
        assert_eq!(f.store.get(), None);
    }

    #[test]
    fn test_acknowledged_stamp_is_not_replayed() {
        let f = fixture(Surface::Admin, "http://localhost:3002/users");
        let signal = f.broadcaster.signal().unwrap();

        // Fresh tokens arrived after that sign-out
        f.store.set(&TokenPair::new("T9", Some("R9".to_string())));
        assert_eq!(f.watcher.acknowledge_current(), Some(signal.timestamp));

        assert_eq!(f.watcher.check(), WatchOutcome::AlreadySeen);
        assert_eq!(f.store.get(), Some(TokenPair::new("T9", Some("R9".to_string()))));
    }

    #[test]
    fn test_own_signal_is_not_replayed() {
        let f = fixture(Surface::App, "http://localhost:3000/");
        let signal = f.broadcaster.signal().unwrap();
        f.watcher.record_seen(signal.timestamp);
        assert_eq!(f.watcher.check(), WatchOutcome::AlreadySeen);
        assert!(f.store.get().is_some());
    }

    #[test]
    fn test_unreadable_signal_is_degraded_not_fatal() {
        let broadcaster = Arc::new(LogoutBroadcaster::new(Arc::new(DomainCookieJar::new(
            Arc::new(DisabledStorage),
            "localhost",
        ))));
        let store = TokenStore::new(Arc::new(MemoryStorage::new()));
        store.set(&TokenPair::new("T1", None));
        let watcher = LogoutWatcher::new(
            broadcaster,
            Arc::new(MemoryStorage::new()),
            store.clone(),
            Arc::new(PageLocation::parse("http://localhost:3000/").unwrap()),
            BackPathResolver::new(Surfaces::default()),
            Surface::App,
            EventBus::new(),
        );
        assert_eq!(watcher.check(), WatchOutcome::Unavailable);
        assert!(store.get().is_some());
    }

    #[tokio::test]
    async fn test_spawned_watcher_observes_within_interval() {
        let f = fixture(Surface::App, "http://localhost:3000/albums");
        let handle = f.watcher.clone().spawn(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.store.get().is_some());

        f.broadcaster.signal().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(f.store.get(), None);
        assert_eq!(f.location.navigations().len(), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_watcher_no_longer_polls() {
        let f = fixture(Surface::App, "http://localhost:3000/");
        let handle = f.watcher.clone().spawn(Duration::from_millis(10));
        handle.stop().await;

        f.broadcaster.signal().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(f.store.get().is_some());
    }
}
