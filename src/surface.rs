// Known application surfaces and their base URLs

use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::ApiError;

/// One independently deployed front-end origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    App,
    Admin,
    Auth,
    Help,
    Info,
    Contact,
}

impl Surface {
    pub const ALL: [Surface; 6] = [
        Surface::App,
        Surface::Admin,
        Surface::Auth,
        Surface::Help,
        Surface::Info,
        Surface::Contact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::App => "app",
            Surface::Admin => "admin",
            Surface::Auth => "auth",
            Surface::Help => "help",
            Surface::Info => "info",
            Surface::Contact => "contact",
        }
    }

    /// Whether a post-login redirect may land on this surface.
    /// The auth portal itself is not a return destination.
    pub fn is_redirect_target(&self) -> bool {
        !matches!(self, Surface::Auth)
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Surface {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "app" | "frontend" => Ok(Surface::App),
            "admin" => Ok(Surface::Admin),
            "auth" => Ok(Surface::Auth),
            "help" => Ok(Surface::Help),
            "info" => Ok(Surface::Info),
            "contact" => Ok(Surface::Contact),
            other => Err(ApiError::Config(format!("unknown surface: {}", other))),
        }
    }
}

/// Base URLs of every surface. Optional micro-sites may be unset.
#[derive(Debug, Clone)]
pub struct Surfaces {
    app: Url,
    admin: Url,
    auth: Url,
    help: Option<Url>,
    info: Option<Url>,
    contact: Option<Url>,
}

impl Surfaces {
    pub fn new(app: Url, admin: Url, auth: Url) -> Self {
        Self {
            app,
            admin,
            auth,
            help: None,
            info: None,
            contact: None,
        }
    }

    /// Parse from raw strings; empty optional values are treated as unset
    pub fn parse(
        app: &str,
        admin: &str,
        auth: &str,
        help: Option<&str>,
        info: Option<&str>,
        contact: Option<&str>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            app: parse_base(app)?,
            admin: parse_base(admin)?,
            auth: parse_base(auth)?,
            help: parse_optional_base(help)?,
            info: parse_optional_base(info)?,
            contact: parse_optional_base(contact)?,
        })
    }

    pub fn with(mut self, surface: Surface, base: Url) -> Self {
        match surface {
            Surface::App => self.app = base,
            Surface::Admin => self.admin = base,
            Surface::Auth => self.auth = base,
            Surface::Help => self.help = Some(base),
            Surface::Info => self.info = Some(base),
            Surface::Contact => self.contact = Some(base),
        }
        self
    }

    pub fn base(&self, surface: Surface) -> Option<&Url> {
        match surface {
            Surface::App => Some(&self.app),
            Surface::Admin => Some(&self.admin),
            Surface::Auth => Some(&self.auth),
            Surface::Help => self.help.as_ref(),
            Surface::Info => self.info.as_ref(),
            Surface::Contact => self.contact.as_ref(),
        }
    }

    /// Base URL as a string without trailing slash, for path joining
    pub fn base_str(&self, surface: Surface) -> Option<String> {
        self.base(surface).map(trimmed)
    }

    pub fn app_base(&self) -> String {
        trimmed(&self.app)
    }

    pub fn auth_base(&self) -> String {
        trimmed(&self.auth)
    }

    /// Which configured surface serves the given URL's origin
    pub fn surface_of(&self, url: &Url) -> Option<Surface> {
        let origin = url.origin();
        Surface::ALL.into_iter().find(|surface| {
            self.base(*surface)
                .is_some_and(|base| base.origin() == origin)
        })
    }

    /// True if the URL's origin belongs to the post-login allow-list
    pub fn is_allowed_redirect(&self, url: &Url) -> bool {
        self.surface_of(url)
            .is_some_and(|surface| surface.is_redirect_target())
    }
}

impl Default for Surfaces {
    fn default() -> Self {
        Self::parse(
            "http://localhost:3000",
            "http://localhost:3002",
            "http://localhost:3001",
            None,
            None,
            None,
        )
        .expect("default surface URLs are valid")
    }
}

fn parse_base(raw: &str) -> Result<Url, ApiError> {
    Url::parse(raw.trim())
        .map_err(|e| ApiError::Config(format!("invalid base URL {:?}: {}", raw, e)))
}

fn parse_optional_base(raw: Option<&str>) -> Result<Option<Url>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => parse_base(value).map(Some),
    }
}

fn trimmed(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}
