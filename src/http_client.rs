use anyhow::Context;
use futures::FutureExt;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{refresh_and_commit, token_preview, RefreshCoordinator, TokenStore};
use crate::error::{ApiError, Result};
use crate::events::{EventBus, SessionEvent};

/// Lifecycle of one outbound request through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Sent with whatever token the store held
    Attached,
    /// Got a 401, waiting on the shared refresh
    AwaitingRefresh,
    /// Resent once with a fresh token
    Retried,
    /// Refresh unavailable or failed; the original 401 is surfaced
    Failed,
}

/// Whether a 401 may trigger the recovery stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Enabled,
    /// Credential and sign-out calls: a 401 is the answer, not an expired session
    Disabled,
}

/// Backend API client with bearer attachment and transparent refresh
///
/// Every request goes through two stages:
/// - attach: adds `Authorization: Bearer <access token>` when one is stored
/// - recovery: on a first 401, joins or starts the single in-flight refresh
///   and resends once with the new token
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// `{API_BASE_URL}/api`
    api_base: String,

    store: TokenStore,

    coordinator: Arc<RefreshCoordinator>,

    events: EventBus,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        api_base_url: &str,
        store: TokenStore,
        events: EventBus,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, api_base_url, store, events))
    }

    /// Create from an existing reqwest client
    pub fn with_client(client: Client, api_base_url: &str, store: TokenStore, events: EventBus) -> Self {
        Self {
            client,
            api_base: format!("{}/api", api_base_url.trim_end_matches('/')),
            store,
            coordinator: Arc::new(RefreshCoordinator::new()),
            events,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Absolute URL for an API path such as `/me`
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.api_base, path)
        } else {
            format!("{}/{}", self.api_base, path)
        }
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.send::<()>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// POST without a body
    pub async fn post_empty(&self, path: &str) -> Result<Response> {
        self.send::<()>(Method::POST, path, None).await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(Method::PATCH, path, Some(body)).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response> {
        self.send::<()>(Method::DELETE, path, None).await
    }

    /// GET and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(self.get(path).await?.json().await?)
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        Ok(self.post(path, body).await?.json().await?)
    }

    /// POST that surfaces a 401 as-is instead of refreshing
    pub async fn post_unrecovered<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        self.send_with(Method::POST, path, body, Recovery::Disabled).await
    }

    /// Build and send a request through the pipeline
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        self.send_with(method, path, body, Recovery::Enabled).await
    }

    pub async fn send_with<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        recovery: Recovery,
    ) -> Result<Response> {
        let mut builder = self.client.request(method, self.endpoint(path));
        if let Some(body) = body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| ApiError::Validation(format!("Request body is not serializable: {}", e)))?;
            builder = builder.header(CONTENT_TYPE, "application/json").body(bytes);
        }
        self.execute_with(builder.build()?, recovery).await
    }

    /// Run a prepared request through attach and recovery
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_with(request, Recovery::Enabled).await
    }

    pub async fn execute_with(&self, mut request: Request, recovery: Recovery) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();

        let sent_token = self.attach(&mut request)?;
        let mut state = RequestState::Attached;

        loop {
            let req = request.try_clone().ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            tracing::debug!(
                request_id = %request_id,
                method = %method,
                url = %url,
                state = ?state,
                "Sending API request"
            );

            let response = match self.client.execute(req).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        url = %url,
                        error = %e,
                        "API request failed before a response arrived"
                    );
                    return Err(ApiError::Transport(e));
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED
                && state == RequestState::Attached
                && recovery == Recovery::Enabled
            {
                state = RequestState::AwaitingRefresh;
                tracing::debug!(
                    request_id = %request_id,
                    state = ?state,
                    "Received 401, recovering session"
                );

                match self.recover(sent_token.as_deref()).await {
                    Some(token) => {
                        set_bearer(&mut request, &token)?;
                        state = RequestState::Retried;
                        continue;
                    }
                    None => {
                        state = RequestState::Failed;
                    }
                }
            }

            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(
                request_id = %request_id,
                status = status.as_u16(),
                url = %url,
                state = ?state,
                "API request returned error response"
            );
            return Err(ApiError::from_response(status, &error_text));
        }
    }

    /// Attach stage: bearer header from the store, if any
    fn attach(&self, request: &mut Request) -> Result<Option<String>> {
        let token = self.store.access_token();
        if let Some(ref token) = token {
            set_bearer(request, token)?;
        }
        Ok(token)
    }

    /// Recovery stage: obtain a token to retry with, or `None` to fail
    async fn recover(&self, sent_token: Option<&str>) -> Option<String> {
        let Some(refresh_token) = self.store.refresh_token() else {
            tracing::info!("No refresh token available, clearing session");
            self.store.clear();
            self.events.publish(SessionEvent::TokensCleared);
            return None;
        };

        // A refresh that settled after this request was sent already rotated the token
        if let Some(current) = self.store.access_token() {
            if Some(current.as_str()) != sent_token {
                tracing::debug!(
                    token = token_preview(&current),
                    "Access token already rotated, retrying without refresh"
                );
                return Some(current);
            }
        }

        let client = self.client.clone();
        let url = self.endpoint("/refresh");
        let store = self.store.clone();
        let events = self.events.clone();

        self.coordinator
            .run_or_join(move || refresh_and_commit(client, url, refresh_token, store, events).boxed())
            .await
    }
}

fn set_bearer(request: &mut Request, token: &str) -> Result<()> {
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ApiError::Validation("Access token is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}
