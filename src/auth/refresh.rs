// Token refresh logic
// One refresh call per burst of 401s; concurrent callers share its outcome

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::store::TokenStore;
use super::types::{token_preview, RefreshRequest, TokenPair, TokenResponse};
use crate::error::{ApiError, Result};
use crate::events::{EventBus, SessionEvent};

/// Exchange a refresh token for a new pair.
///
/// When the backend omits a new refresh token the old one is kept.
pub async fn refresh_tokens(client: &Client, url: &str, refresh_token: &str) -> Result<TokenPair> {
    tracing::debug!(url = %url, "Calling refresh endpoint");

    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh_token: refresh_token.to_string(),
        })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(ApiError::from_response(status, &error_text));
    }

    let data: TokenResponse = response.json().await?;
    let access_token = data
        .access_token()
        .ok_or_else(|| ApiError::Validation("refresh response does not contain token".to_string()))?
        .to_string();
    let refresh_token = data
        .refresh_token()
        .map(str::to_string)
        .or_else(|| Some(refresh_token.to_string()));

    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

/// Refresh and commit the outcome to the store.
///
/// Resolves to the new access token, or `None` after clearing the store
/// when the refresh failed for any reason.
pub async fn refresh_and_commit(
    client: Client,
    url: String,
    refresh_token: String,
    store: TokenStore,
    events: EventBus,
) -> Option<String> {
    match refresh_tokens(&client, &url, &refresh_token).await {
        Ok(pair) => {
            tracing::info!(
                token = token_preview(&pair.access_token),
                "Access token refreshed"
            );
            store.set(&pair);
            events.publish(SessionEvent::TokensRefreshed);
            Some(pair.access_token)
        }
        Err(e) => {
            tracing::error!(error = %e, "Token refresh failed, clearing session");
            store.clear();
            events.publish(SessionEvent::TokensCleared);
            None
        }
    }
}

type PendingRefresh = Shared<BoxFuture<'static, Option<String>>>;

/// At most one in-flight refresh per page context.
///
/// Empty, or holding the pending refresh that every concurrent 401 awaits.
/// The slot empties itself when the refresh settles.
#[derive(Default)]
pub struct RefreshCoordinator {
    pending: Arc<Mutex<Option<(u64, PendingRefresh)>>>,
    next_id: AtomicU64,
    started: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a refresh is in flight
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of refresh operations started over this coordinator's lifetime
    pub fn refreshes_started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Join the in-flight refresh, or start one with `start` if none is pending
    pub async fn run_or_join<F>(&self, start: F) -> Option<String>
    where
        F: FnOnce() -> BoxFuture<'static, Option<String>>,
    {
        let pending = {
            let mut slot = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let in_flight = slot.as_ref().map(|(id, pending)| (*id, pending.clone()));
            match in_flight {
                Some((id, pending)) => {
                    tracing::debug!(refresh_id = id, "Joining in-flight refresh");
                    pending
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    self.started.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(refresh_id = id, "Starting refresh");

                    let inner = start();
                    let slot_handle = Arc::clone(&self.pending);
                    let pending = async move {
                        let outcome = inner.await;
                        let finished = {
                            let mut slot =
                                slot_handle.lock().unwrap_or_else(PoisonError::into_inner);
                            if slot.as_ref().is_some_and(|(pending_id, _)| *pending_id == id) {
                                slot.take()
                            } else {
                                None
                            }
                        };
                        drop(finished);
                        outcome
                    }
                    .boxed()
                    .shared();

                    *slot = Some((id, pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = Arc::clone(&coordinator);
            let release_rx = Arc::clone(&release_rx);
            handles.push(tokio::spawn(async move {
                coordinator
                    .run_or_join(move || {
                        let rx = release_rx.lock().unwrap().take();
                        async move {
                            if let Some(rx) = rx {
                                let _ = rx.await;
                            }
                            Some("T2".to_string())
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        // Let every task reach the coordinator before releasing the refresh
        while !coordinator.is_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();

        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("T2"));
        }
        assert_eq!(coordinator.refreshes_started(), 1);
        assert!(!coordinator.is_pending());
    }

    #[tokio::test]
    async fn test_slot_empties_so_next_burst_refreshes_again() {
        let coordinator = RefreshCoordinator::new();

        let first = coordinator
            .run_or_join(|| async { Some("T2".to_string()) }.boxed())
            .await;
        assert_eq!(first.as_deref(), Some("T2"));
        assert!(!coordinator.is_pending());

        let second = coordinator.run_or_join(|| async { None }.boxed()).await;
        assert_eq!(second, None);
        assert_eq!(coordinator.refreshes_started(), 2);
    }

    #[tokio::test]
    async fn test_refresh_tokens_keeps_old_refresh_when_omitted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/refresh")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"refresh_token": "R1"}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"T2"}"#)
            .create_async()
            .await;

        let url = format!("{}/api/refresh", server.url());
        let pair = refresh_tokens(&Client::new(), &url, "R1").await.unwrap();
        assert_eq!(pair, TokenPair::new("T2", Some("R1".to_string())));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_tokens_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/refresh")
            .with_status(401)
            .with_body(r#"{"code":"INVALID_REFRESH","message":"revoked"}"#)
            .create_async()
            .await;

        let url = format!("{}/api/refresh", server.url());
        let err = refresh_tokens(&Client::new(), &url, "R1").await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn test_refresh_and_commit_clears_on_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/refresh")
            .with_status(500)
            .create_async()
            .await;

        let store = TokenStore::new(Arc::new(crate::storage::MemoryStorage::new()));
        store.set(&TokenPair::new("T1", Some("R1".to_string())));
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let outcome = refresh_and_commit(
            Client::new(),
            format!("{}/api/refresh", server.url()),
            "R1".to_string(),
            store.clone(),
            events,
        )
        .await;

        assert_eq!(outcome, None);
        assert_eq!(store.get(), None);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::TokensCleared);
    }
}
