// Back-path normalization and post-login redirect resolution
//
// A back-path tells the auth portal where to send the user after sign-in.
// It is either a relative path on the primary app or an absolute URL on a
// known surface. Everything else collapses to the app root.

use url::form_urlencoded;
use url::Url;

use crate::surface::{Surface, Surfaces};

/// Query key carrying the back-path
pub const BACK_PATH_PARAM: &str = "back-path";

/// Older keys still read on the login surface, in priority order
pub const LEGACY_BACK_PATH_PARAMS: [&str; 2] = ["return_to", "back_path"];

/// Dummy base used to parse relative paths
const PARSE_BASE: &str = "http://local";

/// A validated return destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackPath {
    /// Path (with optional query) relative to the primary app
    Relative(String),
    /// Absolute URL whose origin is on the surface allow-list
    Absolute(Url),
}

impl BackPath {
    /// The safe default, the app root
    pub fn root() -> Self {
        BackPath::Relative("/".to_string())
    }

    /// Render against the primary app base (no trailing slash)
    pub fn to_url_string(&self, app_base: &str) -> String {
        match self {
            BackPath::Relative(path) => format!("{}{}", app_base, path),
            BackPath::Absolute(url) => url.to_string(),
        }
    }
}

/// Normalize a raw relative back-path.
///
/// Returns `None` for anything not starting with `/`. A nested `back-path`
/// parameter is kept one level deep; anything nested inside it is dropped.
/// Input that cannot be parsed is returned unchanged.
pub fn normalize_back_path(raw: &str) -> Option<String> {
    if !raw.starts_with('/') {
        return None;
    }

    let base = match Url::parse(PARSE_BASE) {
        Ok(base) => base,
        Err(_) => return Some(raw.to_string()),
    };
    let mut url = match base.join(raw) {
        Ok(url) => url,
        Err(_) => return Some(raw.to_string()),
    };

    let nested = url
        .query_pairs()
        .find(|(key, _)| key == BACK_PATH_PARAM)
        .map(|(_, value)| value.into_owned());

    if let Some(nested) = nested.filter(|value| value.starts_with('/')) {
        let mut nested_url = match base.join(&nested) {
            Ok(url) => url,
            Err(_) => return Some(raw.to_string()),
        };
        remove_query_param(&mut nested_url, BACK_PATH_PARAM);
        let flattened = path_and_query(&nested_url);
        set_query_param(&mut url, BACK_PATH_PARAM, &flattened);
    }

    Some(path_and_query(&url))
}

/// `path?query` of a URL, omitting an empty query
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    }
}

/// Remove every occurrence of `name` from the query string
pub fn remove_query_param(url: &mut Url, name: &str) {
    remove_query_params(url, &[name]);
}

/// Remove every occurrence of each name from the query string
pub fn remove_query_params(url: &mut Url, names: &[&str]) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !names.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

/// Replace the first occurrence of `name` (dropping the rest) or append it
pub fn set_query_param(url: &mut Url, name: &str, value: &str) {
    let mut replaced = false;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, existing)| {
            if key != name {
                return Some((key.into_owned(), existing.into_owned()));
            }
            if replaced {
                return None;
            }
            replaced = true;
            Some((key.into_owned(), value.to_string()))
        })
        .collect();

    if !replaced {
        pairs.push((name.to_string(), value.to_string()));
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
}

fn encode_component(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Builds login URLs and validates post-login destinations against the
/// known surfaces
#[derive(Debug, Clone)]
pub struct BackPathResolver {
    surfaces: Surfaces,
}

impl BackPathResolver {
    pub fn new(surfaces: Surfaces) -> Self {
        Self { surfaces }
    }

    pub fn surfaces(&self) -> &Surfaces {
        &self.surfaces
    }

    /// Login URL on the auth portal carrying `current_path` as back-path
    pub fn build_login_url(&self, current_path: &str) -> String {
        let login = format!("{}/login", self.surfaces.auth_base());
        match normalize_back_path(current_path) {
            Some(normalized) => format!(
                "{}?{}={}",
                login,
                BACK_PATH_PARAM,
                encode_component(&normalized)
            ),
            None => login,
        }
    }

    /// Like [`build_login_url`](Self::build_login_url), but a surface other
    /// than the primary app passes an absolute back-path so the user comes
    /// back to that surface instead of the app.
    pub fn build_login_url_for(&self, surface: Surface, current_path: &str) -> String {
        if matches!(surface, Surface::App | Surface::Auth) {
            return self.build_login_url(current_path);
        }

        let (Some(base), Some(normalized)) = (
            self.surfaces.base_str(surface),
            normalize_back_path(current_path),
        ) else {
            return self.build_login_url(current_path);
        };

        format!(
            "{}/login?{}={}",
            self.surfaces.auth_base(),
            BACK_PATH_PARAM,
            encode_component(&format!("{}{}", base, normalized))
        )
    }

    /// Classify a candidate destination. Never fails: unsafe input collapses
    /// to the app root.
    pub fn resolve(&self, candidate: &str) -> BackPath {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            return BackPath::root();
        }

        if trimmed.starts_with('/') {
            return BackPath::Relative(trimmed.to_string());
        }

        match Url::parse(trimmed) {
            Ok(url) if self.surfaces.is_allowed_redirect(&url) => BackPath::Absolute(url),
            Ok(url) => {
                tracing::warn!(
                    origin = %url.origin().ascii_serialization(),
                    "Rejected redirect to unknown origin"
                );
                BackPath::root()
            }
            Err(_) => {
                tracing::debug!("Ignoring unparsable redirect target");
                BackPath::root()
            }
        }
    }

    /// Final destination URL after login
    pub fn build_redirect_url(&self, candidate: &str) -> String {
        self.resolve(candidate)
            .to_url_string(&self.surfaces.app_base())
    }

    /// Read the return destination from a login page query string.
    ///
    /// `back-path` wins; the legacy `return_to` and `back_path` keys are
    /// still honoured with a warning.
    pub fn destination_from_query(&self, query: &str) -> String {
        let query = query.strip_prefix('?').unwrap_or(query);
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        let lookup = |name: &str| {
            pairs
                .iter()
                .find(|(key, value)| key == name && !value.trim().is_empty())
                .map(|(_, value)| value.clone())
        };

        let raw = lookup(BACK_PATH_PARAM).or_else(|| {
            LEGACY_BACK_PATH_PARAMS.iter().find_map(|legacy| {
                let value = lookup(legacy)?;
                tracing::warn!(param = legacy, "Deprecated back-path parameter in login URL");
                Some(value)
            })
        });

        let Some(raw) = raw else {
            return self.build_redirect_url("");
        };

        let candidate = if raw.starts_with('/') {
            normalize_back_path(&raw).unwrap_or(raw)
        } else {
            raw
        };
        self.build_redirect_url(&candidate)
    }
}
