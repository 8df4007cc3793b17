// Session context
// One per loaded page: created at start-up, dropped on full reload

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::{TokenPair, TokenResponse, TokenStore};
use crate::back_path::{normalize_back_path, path_and_query, BackPathResolver};
use crate::bridge::{with_handoff, BridgeOutcome, TokenBridge};
use crate::error::{ApiError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::http_client::ApiClient;
use crate::location::Location;
use crate::logout::{DomainCookieJar, LogoutBroadcaster, LogoutWatcher, WatcherHandle};
use crate::storage::Storage;
use crate::surface::{Surface, Surfaces};

/// Tunables for a session context
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub poll_interval: Duration,
    pub logout_cookie_max_age_secs: i64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            poll_interval: Duration::from_millis(2000),
            logout_cookie_max_age_secs: crate::logout::LOGOUT_COOKIE_MAX_AGE_SECS,
        }
    }
}

/// `POST /login` body
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub back_path: String,
}

/// `POST /signup` body
#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub back_path: String,
}

/// `POST /invites/{token}/accept` body
#[derive(Debug, Clone, Serialize)]
pub struct AcceptInviteRequest {
    pub email: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Invite preview returned by `GET /invites/{token}`
#[derive(Debug, Clone, Deserialize)]
pub struct InviteInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub group_name: Option<String>,
}

/// Where a completed sign-in sends the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub redirect_url: String,
    /// Tokens ride along in the URL because the destination is another origin
    pub handed_off: bool,
}

/// Everything a surface needs for its session, wired explicitly
pub struct SessionContext {
    surface: Surface,
    resolver: BackPathResolver,
    store: TokenStore,
    api: ApiClient,
    bridge: TokenBridge,
    broadcaster: Arc<LogoutBroadcaster>,
    watcher: Arc<LogoutWatcher>,
    location: Arc<dyn Location>,
    events: EventBus,
    poll_interval: Duration,
}

impl SessionContext {
    /// Build a context for `surface`.
    ///
    /// `local` is this origin's storage, `cookies` the parent-domain jar
    /// shared with every other surface.
    pub fn new(
        surface: Surface,
        surfaces: Surfaces,
        api_base_url: &str,
        local: Arc<dyn Storage>,
        cookies: Arc<DomainCookieJar>,
        location: Arc<dyn Location>,
        options: SessionOptions,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new();
        let store = TokenStore::new(Arc::clone(&local));
        let resolver = BackPathResolver::new(surfaces);
        let api = ApiClient::new(
            api_base_url,
            store.clone(),
            events.clone(),
            options.connect_timeout_secs,
            options.request_timeout_secs,
        )?;
        let broadcaster = Arc::new(
            LogoutBroadcaster::new(cookies).with_max_age(options.logout_cookie_max_age_secs),
        );
        let watcher = Arc::new(LogoutWatcher::new(
            Arc::clone(&broadcaster),
            local,
            store.clone(),
            Arc::clone(&location),
            resolver.clone(),
            surface,
            events.clone(),
        ));

        tracing::debug!(surface = %surface, "Session context created");

        Ok(Self {
            surface,
            resolver,
            bridge: TokenBridge::new(store.clone(), events.clone()),
            store,
            api,
            broadcaster,
            watcher,
            location,
            events,
            poll_interval: options.poll_interval,
        })
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn resolver(&self) -> &BackPathResolver {
        &self.resolver
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn watcher(&self) -> &Arc<LogoutWatcher> {
        &self.watcher
    }

    pub fn location(&self) -> &Arc<dyn Location> {
        &self.location
    }

    /// Page-load hook: import handed-over tokens
    pub fn start(&self) -> BridgeOutcome {
        let outcome = self.bridge.run(self.location.as_ref());
        if matches!(outcome, BridgeOutcome::Imported { .. }) {
            self.watcher.acknowledge_current();
        }
        outcome
    }

    /// Start the logout watcher; drop or stop the handle on teardown
    pub fn watch(&self) -> WatcherHandle {
        Arc::clone(&self.watcher).spawn(self.poll_interval)
    }

    /// `GET /me`
    pub async fn me(&self) -> Result<serde_json::Value> {
        self.api.get_json("/me").await
    }

    /// On the login page: skip the form when the user is already signed in.
    /// Returns the destination navigated to, if any.
    pub async fn redirect_if_signed_in(&self, login_query: &str) -> Option<String> {
        if self.store.access_token().is_none() && self.store.refresh_token().is_none() {
            return None;
        }
        match self.me().await {
            Ok(_) => {
                let mut destination = self.resolver.destination_from_query(login_query);
                if let Some(pair) = self.store.get() {
                    if self.is_cross_origin(&destination) {
                        match with_handoff(&destination, &pair) {
                            Ok(url) => destination = url,
                            Err(e) => tracing::warn!(error = %e, "Could not attach handoff tokens"),
                        }
                    }
                }
                tracing::info!(surface = %self.surface, "Already signed in, skipping login");
                self.location.navigate(&destination);
                Some(destination)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Not signed in");
                None
            }
        }
    }

    /// Sign in and navigate to the destination named by the login page query
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        login_query: &str,
    ) -> Result<LoginOutcome> {
        let destination = self.resolver.destination_from_query(login_query);
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
            back_path: self.relative_back_path(&destination),
        };

        let response: TokenResponse = self
            .api
            .post_unrecovered("/login", Some(&request))
            .await?
            .json()
            .await?;
        self.complete_sign_in(response, destination)
    }

    /// Create an account, then continue like [`login`](Self::login)
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
        login_query: &str,
    ) -> Result<LoginOutcome> {
        let destination = self.resolver.destination_from_query(login_query);
        let request = SignupRequest {
            email: email.to_string(),
            password: password.to_string(),
            display_name: display_name.to_string(),
            back_path: self.relative_back_path(&destination),
        };

        let response: TokenResponse = self
            .api
            .post_unrecovered("/signup", Some(&request))
            .await?
            .json()
            .await?;
        self.complete_sign_in(response, destination)
    }

    /// `GET /invites/{token}`
    pub async fn invite(&self, invite_token: &str) -> Result<InviteInfo> {
        self.api
            .get_json(&format!("/invites/{}", encode_segment(invite_token)))
            .await
    }

    /// Accept an invite, then send the user to log in and return to the app.
    /// Returns the login URL navigated to.
    pub async fn accept_invite(
        &self,
        invite_token: &str,
        request: &AcceptInviteRequest,
    ) -> Result<String> {
        if request.email.trim().is_empty() {
            return Err(ApiError::Validation("invite email is required".to_string()));
        }

        self.api
            .post(
                &format!("/invites/{}/accept", encode_segment(invite_token)),
                request,
            )
            .await?;

        tracing::info!("Invite accepted, redirecting to login");
        let login_url = self.resolver.build_login_url_for(self.surface, "/");
        self.location.navigate(&login_url);
        Ok(login_url)
    }

    /// Sign out everywhere.
    ///
    /// Stamps the shared signal (and this surface's watermark, so it does not
    /// react to its own stamp), tells the backend, clears tokens, and goes to
    /// the login page. Backend or storage failures do not stop the sign-out.
    pub async fn logout(&self) -> String {
        let timestamp = match self.broadcaster.signal() {
            Ok(signal) => {
                self.watcher.record_seen(signal.timestamp);
                Some(signal.timestamp)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not stamp logout signal");
                None
            }
        };

        if let Err(e) = self.api.post_unrecovered::<()>("/logout", None).await {
            tracing::warn!(error = %e, "Backend logout failed, clearing local session anyway");
        }

        self.store.clear();
        if let Some(timestamp) = timestamp {
            self.events.publish(SessionEvent::LoggedOut { timestamp });
        }

        let login_url = self
            .resolver
            .build_login_url_for(self.surface, &path_and_query(&self.location.href()));
        if !self.on_login_page() {
            self.location.navigate(&login_url);
        }
        login_url
    }

    /// Send the user to log in after a request failed for good.
    ///
    /// Only acts on an unauthorized error once the session has been cleared;
    /// the login URL carries the current page as back-path.
    pub fn redirect_on_unauthorized(&self, err: &ApiError) -> Option<String> {
        if !err.is_unauthorized() || self.store.get().is_some() || self.on_login_page() {
            return None;
        }
        let href = self.location.href();
        let login_url = self
            .resolver
            .build_login_url_for(self.surface, &path_and_query(&href));
        tracing::info!(surface = %self.surface, "Session expired, redirecting to login");
        self.location.navigate(&login_url);
        Some(login_url)
    }

    fn complete_sign_in(&self, response: TokenResponse, destination: String) -> Result<LoginOutcome> {
        let pair = response.access_token().map(|access| {
            TokenPair::new(access, response.refresh_token().map(str::to_string))
        });

        if let Some(ref pair) = pair {
            self.store.set(pair);
            self.watcher.acknowledge_current();
        } else {
            tracing::debug!("Login response carried no tokens");
        }

        let mut redirect_url = destination;
        let mut handed_off = false;
        if let Some(ref pair) = pair {
            if self.is_cross_origin(&redirect_url) {
                redirect_url = with_handoff(&redirect_url, pair)
                    .map_err(|e| ApiError::Internal(anyhow::anyhow!("invalid redirect URL: {}", e)))?;
                handed_off = true;
            }
        }

        tracing::info!(surface = %self.surface, handed_off, "Signed in");
        self.events.publish(SessionEvent::LoggedIn {
            redirect_url: redirect_url.clone(),
        });
        self.location.navigate(&redirect_url);

        Ok(LoginOutcome {
            redirect_url,
            handed_off,
        })
    }

    /// Destination as the relative back-path to report to the backend
    fn relative_back_path(&self, destination: &str) -> String {
        let Ok(url) = Url::parse(destination) else {
            return String::new();
        };
        if self.resolver.surfaces().surface_of(&url) != Some(Surface::App) {
            return String::new();
        }
        normalize_back_path(&path_and_query(&url)).unwrap_or_default()
    }

    fn is_cross_origin(&self, destination: &str) -> bool {
        let Ok(url) = Url::parse(destination) else {
            return false;
        };
        match self.resolver.surfaces().base(self.surface) {
            Some(base) => base.origin() != url.origin(),
            None => true,
        }
    }

    fn on_login_page(&self) -> bool {
        self.surface == Surface::Auth && self.location.href().path().starts_with("/login")
    }
}

/// Unreserved characters stay literal in a path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::PageLocation;
    use crate::storage::MemoryStorage;

    fn context(surface: Surface, href: &str, api: &str) -> (SessionContext, Arc<PageLocation>) {
        let location = Arc::new(PageLocation::parse(href).unwrap());
        let cookies = Arc::new(DomainCookieJar::new(Arc::new(MemoryStorage::new()), "localhost"));
        let ctx = SessionContext::new(
            surface,
            Surfaces::default(),
            api,
            Arc::new(MemoryStorage::new()),
            cookies,
            location.clone(),
            SessionOptions::default(),
        )
        .unwrap();
        (ctx, location)
    }

    #[test]
    fn test_relative_back_path_only_for_app() {
        let (ctx, _) = context(Surface::Auth, "http://localhost:3001/login", "http://localhost:8080");
        assert_eq!(ctx.relative_back_path("http://localhost:3000/trips?y=1"), "/trips?y=1");
        assert_eq!(ctx.relative_back_path("http://localhost:3002/users"), "");
        assert_eq!(ctx.relative_back_path("garbage"), "");
    }

    #[test]
    fn test_cross_origin_detection() {
        let (ctx, _) = context(Surface::Auth, "http://localhost:3001/login", "http://localhost:8080");
        assert!(ctx.is_cross_origin("http://localhost:3000/"));
        assert!(!ctx.is_cross_origin("http://localhost:3001/signup"));
    }

    #[test]
    fn test_start_imports_handoff() {
        let (ctx, location) = context(
            Surface::App,
            "http://localhost:3000/trips?auth_token=T1&refresh_token=R1",
            "http://localhost:8080",
        );
        assert!(matches!(ctx.start(), BridgeOutcome::Imported { .. }));
        assert_eq!(ctx.store().get(), Some(TokenPair::new("T1", Some("R1".to_string()))));
        assert_eq!(location.href().as_str(), "http://localhost:3000/trips");
        assert_eq!(ctx.start(), BridgeOutcome::NoHandoff);
    }

    #[tokio::test]
    async fn test_login_same_origin_has_no_handoff() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_body(r#"{"token":"T1","refresh_token":"R1"}"#)
            .create_async()
            .await;

        // App surface running its own login page
        let (ctx, location) = context(Surface::App, "http://localhost:3000/login", &server.url());
        let outcome = ctx.login("a@b.c", "pw", "back-path=%2Ftrips").await.unwrap();
        assert_eq!(
            outcome,
            LoginOutcome {
                redirect_url: "http://localhost:3000/trips".to_string(),
                handed_off: false,
            }
        );
        assert_eq!(location.navigations(), vec!["http://localhost:3000/trips"]);
    }

    #[tokio::test]
    async fn test_login_failure_keeps_user_on_page() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/api/login")
            .with_status(401)
            .with_body(r#"{"code":"EMAIL_NOT_VERIFIED","message":"verify first"}"#)
            .create_async()
            .await;

        let (ctx, location) = context(Surface::Auth, "http://localhost:3001/login", &server.url());
        let err = ctx.login("a@b.c", "pw", "").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(err.code(), Some("EMAIL_NOT_VERIFIED"));
        assert!(location.navigations().is_empty());
        assert_eq!(ctx.store().get(), None);
    }

    #[tokio::test]
    async fn test_rejected_login_leaves_stale_session_alone() {
        let mut server = mockito::Server::new_async().await;
        let login = server
            .mock("POST", "/api/login")
            .with_status(401)
            .with_body(r#"{"code":"INVALID_CREDENTIALS","message":"bad password"}"#)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/api/refresh")
            .expect(0)
            .create_async()
            .await;

        let (ctx, location) = context(Surface::Auth, "http://localhost:3001/login", &server.url());
        ctx.store().set(&TokenPair::new("T-stale", Some("R-stale".to_string())));

        let err = ctx.login("a@b.c", "wrong", "").await.unwrap_err();
        assert_eq!(err.code(), Some("INVALID_CREDENTIALS"));
        assert_eq!(ctx.api().coordinator().refreshes_started(), 0);
        assert_eq!(
            ctx.store().get(),
            Some(TokenPair::new("T-stale", Some("R-stale".to_string())))
        );
        assert!(location.navigations().is_empty());

        login.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_signup_does_not_refresh() {
        let mut server = mockito::Server::new_async().await;
        let _signup = server
            .mock("POST", "/api/signup")
            .with_status(401)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/api/refresh")
            .expect(0)
            .create_async()
            .await;

        let (ctx, _) = context(Surface::Auth, "http://localhost:3001/signup", &server.url());
        ctx.store().set(&TokenPair::new("T-stale", Some("R-stale".to_string())));

        let err = ctx.signup("a@b.c", "pw", "Kana", "").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(ctx.api().coordinator().refreshes_started(), 0);
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_logout_with_expired_token_skips_refresh() {
        let mut server = mockito::Server::new_async().await;
        let logout = server
            .mock("POST", "/api/logout")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/api/refresh")
            .expect(0)
            .create_async()
            .await;

        let (ctx, _) = context(Surface::App, "http://localhost:3000/", &server.url());
        ctx.store().set(&TokenPair::new("T1", Some("R1".to_string())));

        ctx.logout().await;
        assert_eq!(ctx.store().get(), None);
        assert_eq!(ctx.api().coordinator().refreshes_started(), 0);

        logout.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_logout_login_url_carries_current_page() {
        let mut server = mockito::Server::new_async().await;
        let _logout = server
            .mock("POST", "/api/logout")
            .with_status(204)
            .create_async()
            .await;

        let (ctx, location) =
            context(Surface::App, "http://localhost:3000/trips?year=2024", &server.url());
        ctx.store().set(&TokenPair::new("T1", Some("R1".to_string())));

        let login_url = ctx.logout().await;
        assert_eq!(
            login_url,
            "http://localhost:3001/login?back-path=%2Ftrips%3Fyear%3D2024"
        );
        assert_eq!(location.navigations(), vec![login_url]);
    }

    #[tokio::test]
    async fn test_signed_in_redirect_hands_off_to_other_origin() {
        let mut server = mockito::Server::new_async().await;
        let _me = server
            .mock("GET", "/api/me")
            .with_status(200)
            .with_body(r#"{"id":1}"#)
            .create_async()
            .await;

        let (ctx, location) = context(Surface::Auth, "http://localhost:3001/login", &server.url());
        ctx.store().set(&TokenPair::new("T1", Some("R1".to_string())));

        let destination = ctx.redirect_if_signed_in("back-path=%2Ftrips").await;
        assert_eq!(
            destination.as_deref(),
            Some("http://localhost:3000/trips?auth_token=T1&refresh_token=R1")
        );
        assert_eq!(location.navigations().len(), 1);
    }

    #[tokio::test]
    async fn test_sign_in_acknowledges_earlier_logout() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_body(r#"{"token":"T2","refresh_token":"R2"}"#)
            .create_async()
            .await;

        let (ctx, _) = context(Surface::App, "http://localhost:3000/login", &server.url());
        assert_eq!(ctx.watcher().check(), crate::logout::WatchOutcome::NoSignal);
        ctx.broadcaster.signal().unwrap();

        ctx.login("a@b.c", "pw", "back-path=%2Ftrips").await.unwrap();
        assert_eq!(ctx.watcher().check(), crate::logout::WatchOutcome::AlreadySeen);
        assert_eq!(ctx.store().get(), Some(TokenPair::new("T2", Some("R2".to_string()))));
    }

    #[test]
    fn test_invite_segment_encoding() {
        assert_eq!(encode_segment("a b+c"), "a%20b%2Bc");
        assert_eq!(encode_segment("tok-1.2_3~"), "tok-1.2_3~");
        assert_eq!(encode_segment("x/y"), "x%2Fy");
    }

    #[tokio::test]
    async fn test_expired_session_redirects_with_back_path() {
        let mut server = mockito::Server::new_async().await;
        let _trips = server
            .mock("GET", "/api/trips")
            .with_status(401)
            .create_async()
            .await;

        let (ctx, location) =
            context(Surface::App, "http://localhost:3000/trips?year=2024", &server.url());
        ctx.store().set(&TokenPair::new("T1", None));

        let err = ctx.api().get("/trips").await.unwrap_err();
        assert_eq!(
            ctx.redirect_on_unauthorized(&err).as_deref(),
            Some("http://localhost:3001/login?back-path=%2Ftrips%3Fyear%3D2024")
        );
        assert_eq!(location.navigations().len(), 1);

        let other = ApiError::Validation("bad".to_string());
        assert_eq!(ctx.redirect_on_unauthorized(&other), None);
    }

    #[tokio::test]
    async fn test_accept_invite_requires_email() {
        let (ctx, _) = context(Surface::App, "http://localhost:3000/invites/x", "http://localhost:8080");
        let err = ctx
            .accept_invite(
                "x",
                &AcceptInviteRequest {
                    email: " ".to_string(),
                    display_name: "Kana".to_string(),
                    password: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
