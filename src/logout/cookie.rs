// Parent-domain cookie jar
// Cookies are persisted with their attributes; expiry is enforced on read

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::storage::{Storage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Strict => f.write_str("Strict"),
            SameSite::Lax => f.write_str("Lax"),
            SameSite::None => f.write_str("None"),
        }
    }
}

/// A cookie with the attributes the session core uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: Option<String>,
    pub max_age_secs: Option<i64>,
    pub same_site: SameSite,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: "/".to_string(),
            domain: None,
            max_age_secs: None,
            same_site: SameSite::Lax,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_max_age(mut self, secs: i64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// Render as a `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}; Path={}", self.name, self.value, self.path);
        if let Some(ref domain) = self.domain {
            out.push_str(&format!("; Domain={}", domain));
        }
        if let Some(max_age) = self.max_age_secs {
            out.push_str(&format!("; Max-Age={}", max_age));
        }
        out.push_str(&format!("; SameSite={}", self.same_site));
        out
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCookie {
    cookie: Cookie,
    /// Unix milliseconds; `None` for session cookies
    expires_at_ms: Option<i64>,
}

/// Cookies visible to every surface under one parent domain
pub struct DomainCookieJar {
    storage: Arc<dyn Storage>,
    domain: String,
}

impl DomainCookieJar {
    pub fn new(storage: Arc<dyn Storage>, domain: impl Into<String>) -> Self {
        Self {
            storage,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Store (overwrite) a cookie. A non-positive max-age deletes it.
    pub fn set(&self, cookie: &Cookie, now_ms: i64) -> Result<(), StorageError> {
        let expires_at_ms = match cookie.max_age_secs {
            Some(secs) if secs <= 0 => return self.storage.remove(&cookie.name),
            Some(secs) => Some(now_ms.saturating_add(secs.saturating_mul(1000))),
            None => None,
        };

        let stored = StoredCookie {
            cookie: cookie.clone(),
            expires_at_ms,
        };
        let encoded = serde_json::to_string(&stored)
            .map_err(|e| StorageError::Unavailable(format!("cookie encoding failed: {}", e)))?;
        self.storage.set(&cookie.name, &encoded)
    }

    /// Value of a live cookie
    pub fn get(&self, name: &str, now_ms: i64) -> Result<Option<String>, StorageError> {
        let Some(raw) = self.storage.get(name)? else {
            return Ok(None);
        };

        let stored: StoredCookie = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(cookie = name, error = %e, "Discarding unreadable cookie");
                return Ok(None);
            }
        };

        if stored.expires_at_ms.is_some_and(|expires| now_ms >= expires) {
            return Ok(None);
        }
        Ok(Some(stored.cookie.value))
    }

    pub fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.storage.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn jar() -> DomainCookieJar {
        DomainCookieJar::new(Arc::new(MemoryStorage::new()), "localhost")
    }

    #[test]
    fn test_session_cookie_never_expires() {
        let jar = jar();
        jar.set(&Cookie::new("k", "v"), 0).unwrap();
        assert_eq!(jar.get("k", i64::MAX).unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_zero_max_age_deletes() {
        let jar = jar();
        jar.set(&Cookie::new("k", "v"), 0).unwrap();
        jar.set(&Cookie::new("k", "").with_max_age(0), 0).unwrap();
        assert_eq!(jar.get("k", 0).unwrap(), None);
    }

    #[test]
    fn test_header_value_without_optional_attributes() {
        assert_eq!(
            Cookie::new("k", "v").to_header_value(),
            "k=v; Path=/; SameSite=Lax"
        );
    }
}
