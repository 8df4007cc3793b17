// Origin-local token store

use std::sync::Arc;

use super::types::{token_preview, TokenPair};
use crate::storage::Storage;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "memoria_token";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "memoria_refresh_token";

/// Access/refresh token holder for one origin.
///
/// Storage failures never propagate: reads degrade to "no token" and
/// writes are logged and dropped. Callers treat "no token" as signed out.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn Storage>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Current pair, if an access token is present
    pub fn get(&self) -> Option<TokenPair> {
        let access_token = self.access_token()?;
        Some(TokenPair {
            access_token,
            refresh_token: self.refresh_token(),
        })
    }

    /// Replace the stored pair. A pair without refresh token removes any
    /// previously stored one.
    pub fn set(&self, pair: &TokenPair) {
        self.set_access_token(&pair.access_token);
        match pair.refresh_token.as_deref() {
            Some(refresh) => self.set_refresh_token(refresh),
            None => self.clear_refresh_token(),
        }
        tracing::debug!(
            token = token_preview(&pair.access_token),
            has_refresh = pair.refresh_token.is_some(),
            "Stored token pair"
        );
    }

    /// Remove both tokens
    pub fn clear(&self) {
        self.clear_access_token();
        self.clear_refresh_token();
        tracing::debug!("Cleared token pair");
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    pub fn set_access_token(&self, token: &str) {
        self.write(ACCESS_TOKEN_KEY, token);
    }

    pub fn set_refresh_token(&self, token: &str) {
        self.write(REFRESH_TOKEN_KEY, token);
    }

    pub fn clear_access_token(&self) {
        self.delete(ACCESS_TOKEN_KEY);
    }

    pub fn clear_refresh_token(&self) {
        self.delete(REFRESH_TOKEN_KEY);
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!(key, error = %e, "Token storage unavailable, treating as signed out");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.storage.set(key, value) {
            tracing::warn!(key, error = %e, "Failed to persist token");
        }
    }

    fn delete(&self, key: &str) {
        if let Err(e) = self.storage.remove(key) {
            tracing::warn!(key, error = %e, "Failed to remove token");
        }
    }
}
