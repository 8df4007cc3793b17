use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::surface::{Surface, Surfaces};

/// Memoria session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend API origin (requests go to {API_BASE_URL}/api)
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8080", global = true)]
    pub api_base_url: String,

    /// Primary app surface origin
    #[arg(long, env = "APP_BASE_URL", default_value = "http://localhost:3000", global = true)]
    pub app_base_url: String,

    /// Auth portal origin
    #[arg(long, env = "AUTH_BASE_URL", default_value = "http://localhost:3001", global = true)]
    pub auth_base_url: String,

    /// Admin console origin
    #[arg(long, env = "ADMIN_BASE_URL", default_value = "http://localhost:3002", global = true)]
    pub admin_base_url: String,

    /// Help site origin
    #[arg(long, env = "HELP_BASE_URL", global = true)]
    pub help_base_url: Option<String>,

    /// Info site origin
    #[arg(long, env = "INFO_BASE_URL", global = true)]
    pub info_base_url: Option<String>,

    /// Contact site origin
    #[arg(long, env = "CONTACT_BASE_URL", global = true)]
    pub contact_base_url: Option<String>,

    /// Surface this process acts as (app, admin, auth, help, info, contact)
    #[arg(short = 's', long, env = "SURFACE", default_value = "app", global = true)]
    pub surface: String,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE", global = true)]
    pub db_file: Option<String>,

    /// Parent domain shared by every surface
    #[arg(long, env = "COOKIE_DOMAIN", default_value = "localhost", global = true)]
    pub cookie_domain: String,

    /// Logout watcher poll interval in milliseconds
    #[arg(long, env = "LOGOUT_POLL_INTERVAL_MS", default_value = "2000", global = true)]
    pub logout_poll_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30", global = true)]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign in and print the redirect URL
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MEMORIA_PASSWORD")]
        password: String,
        /// Login page query string, e.g. "back-path=%2Ftrips"
        #[arg(long, default_value = "")]
        query: String,
    },
    /// Create an account and print the redirect URL
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MEMORIA_PASSWORD")]
        password: String,
        #[arg(long)]
        display_name: String,
        #[arg(long, default_value = "")]
        query: String,
    },
    /// Print the signed-in user
    Me,
    /// Sign out on every surface
    Logout,
    /// Run the logout watcher until interrupted
    Watch,
    /// Import handoff tokens from a page URL and print the scrubbed URL
    Bridge { url: String },
    /// Print the post-login destination for a candidate back-path
    Resolve { candidate: String },
    /// Print the login URL for a path on this surface
    LoginUrl {
        #[arg(default_value = "/")]
        path: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Origins
    pub api_base_url: String,
    pub surfaces: Surfaces,
    pub surface: Surface,

    // Storage
    pub session_db_file: PathBuf,
    pub cookie_domain: String,

    // Logout propagation
    pub logout_poll_interval: Duration,
    pub logout_cookie_max_age: i64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults.
    /// Returns the subcommand alongside.
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let surfaces = Surfaces::parse(
            &args.app_base_url,
            &args.admin_base_url,
            &args.auth_base_url,
            args.help_base_url.as_deref(),
            args.info_base_url.as_deref(),
            args.contact_base_url.as_deref(),
        )
        .context("Invalid surface base URL")?;

        let surface: Surface = args.surface.parse()?;

        let session_db_file = args
            .db_file
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_db_file);

        Ok(Config {
            api_base_url: args.api_base_url.trim_end_matches('/').to_string(),
            surfaces,
            surface,

            session_db_file,
            cookie_domain: args.cookie_domain.clone(),

            logout_poll_interval: Duration::from_millis(args.logout_poll_interval_ms),
            logout_cookie_max_age: std::env::var("LOGOUT_COOKIE_MAX_AGE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(crate::logout::LOGOUT_COOKIE_MAX_AGE_SECS),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if self.surfaces.base(self.surface).is_none() {
            anyhow::bail!(
                "SURFACE is {} but {}_BASE_URL is not set",
                self.surface,
                self.surface.as_str().to_uppercase()
            );
        }

        if self.logout_poll_interval.is_zero() {
            anyhow::bail!("LOGOUT_POLL_INTERVAL_MS must be greater than zero");
        }

        if self.cookie_domain.trim().is_empty() {
            anyhow::bail!("COOKIE_DOMAIN cannot be empty");
        }

        Ok(())
    }

    /// Storage scope for this surface's origin-local keys
    pub fn origin_scope(&self) -> String {
        self.surfaces
            .base(self.surface)
            .map(|base| base.origin().ascii_serialization())
            .unwrap_or_else(|| self.surface.to_string())
    }

    /// Storage scope for the shared parent-domain cookie jar
    pub fn cookie_scope(&self) -> String {
        format!("cookie:{}", self.cookie_domain)
    }
}

fn default_db_file() -> PathBuf {
    expand_tilde("~/.local/share/memoria/session.sqlite3")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
