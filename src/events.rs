// Session event bus
// Components publish lifecycle changes; the UI layer subscribes

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::surface::Surface;

const EVENT_CAPACITY: usize = 64;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Tokens arrived through a cross-origin handoff URL
    TokensImported,
    /// A refresh replaced the stored pair
    TokensRefreshed,
    /// Tokens were cleared after an unrecoverable failure
    TokensCleared,
    /// Sign-in completed; `redirect_url` is where the user goes next
    LoggedIn { redirect_url: String },
    /// This surface initiated a sign-out stamped at `timestamp`
    LoggedOut { timestamp: i64 },
    /// Another surface's sign-out was observed
    LogoutObserved { surface: Surface, timestamp: i64 },
}

/// Broadcast fan-out of [`SessionEvent`]s. Clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is not an error
    pub fn publish(&self, event: SessionEvent) {
        tracing::trace!(event = ?event, "Publishing session event");
        let _ = self.tx.send(event);
    }
}

/// Next event for a long-lived subscriber. Skips past a lag instead of
/// ending; `None` once every sender is gone.
pub async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<SessionEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event subscriber fell behind");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::TokensRefreshed);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::TokensRefreshed);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for timestamp in 0..(EVENT_CAPACITY as i64 + 10) {
            bus.publish(SessionEvent::LoggedOut { timestamp });
        }
        bus.publish(SessionEvent::TokensCleared);

        let mut last = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), next_event(&mut rx)).await
        {
            last = Some(event);
        }
        assert_eq!(last, Some(SessionEvent::TokensCleared));
    }

    #[tokio::test]
    async fn test_next_event_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        drop(bus);
        assert_eq!(next_event(&mut rx).await, None);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::TokensCleared);
    }
}
