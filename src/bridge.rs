// Cross-origin token bridge
// Imports tokens handed over in the page URL, then scrubs them from the address bar

use url::Url;

use crate::auth::{token_preview, TokenPair, TokenStore};
use crate::back_path::{remove_query_params, set_query_param};
use crate::events::{EventBus, SessionEvent};
use crate::location::Location;

/// Query key carrying the access token across origins
pub const AUTH_TOKEN_PARAM: &str = "auth_token";

/// Query key carrying the refresh token across origins
pub const REFRESH_TOKEN_PARAM: &str = "refresh_token";

/// Result of one bridge pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// No handoff parameters in the URL
    NoHandoff,
    /// Tokens were committed and the URL scrubbed
    Imported {
        access_token: bool,
        refresh_token: bool,
    },
    /// Handoff keys were present but empty; the URL was scrubbed
    Scrubbed,
}

/// Runs once per page view on every surface
#[derive(Clone)]
pub struct TokenBridge {
    store: TokenStore,
    events: EventBus,
}

impl TokenBridge {
    pub fn new(store: TokenStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Import handoff tokens from the current URL.
    ///
    /// An incoming handoff always replaces whatever pair was stored. Running
    /// again on the scrubbed URL is a no-op.
    pub fn run(&self, location: &dyn Location) -> BridgeOutcome {
        let mut url = location.href();

        let mut present = false;
        let mut access_token = None;
        let mut refresh_token = None;
        for (key, value) in url.query_pairs() {
            if key == AUTH_TOKEN_PARAM {
                present = true;
                if access_token.is_none() && !value.is_empty() {
                    access_token = Some(value.into_owned());
                }
            } else if key == REFRESH_TOKEN_PARAM {
                present = true;
                if refresh_token.is_none() && !value.is_empty() {
                    refresh_token = Some(value.into_owned());
                }
            }
        }

        if !present {
            return BridgeOutcome::NoHandoff;
        }

        let outcome = match (access_token, refresh_token) {
            (None, None) => BridgeOutcome::Scrubbed,
            (Some(access), refresh) => {
                tracing::info!(
                    token = token_preview(&access),
                    has_refresh = refresh.is_some(),
                    "Imported tokens from cross-origin handoff"
                );
                let has_refresh = refresh.is_some();
                self.store.set(&TokenPair::new(access, refresh));
                BridgeOutcome::Imported {
                    access_token: true,
                    refresh_token: has_refresh,
                }
            }
            (None, Some(refresh)) => {
                tracing::info!("Imported refresh token from cross-origin handoff");
                self.store.clear_access_token();
                self.store.set_refresh_token(&refresh);
                BridgeOutcome::Imported {
                    access_token: false,
                    refresh_token: true,
                }
            }
        };

        remove_query_params(&mut url, &[AUTH_TOKEN_PARAM, REFRESH_TOKEN_PARAM]);
        location.replace_history(&url);

        if matches!(outcome, BridgeOutcome::Imported { .. }) {
            self.events.publish(SessionEvent::TokensImported);
        }
        outcome
    }
}

/// Append handoff parameters to a cross-origin destination
pub fn with_handoff(destination: &str, pair: &TokenPair) -> Result<String, url::ParseError> {
    let mut url = Url::parse(destination)?;
    set_query_param(&mut url, AUTH_TOKEN_PARAM, &pair.access_token);
    match pair.refresh_token.as_deref() {
        Some(refresh) => set_query_param(&mut url, REFRESH_TOKEN_PARAM, refresh),
        None => remove_query_params(&mut url, &[REFRESH_TOKEN_PARAM]),
    }
    Ok(url.to_string())
}
