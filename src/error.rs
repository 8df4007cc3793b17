// Error handling module
// Defines the error types surfaced to UI callers of the session core

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced by the request pipeline and session flows
#[derive(Error, Debug)]
pub enum ApiError {
    /// Backend rejected the credentials (401) and no refresh could recover it
    #[error("Unauthorized: {message}")]
    Unauthorized {
        code: Option<String>,
        message: String,
    },

    /// Any other non-success response from the backend
    #[error("API error: {status} - {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Network failure before a response arrived
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Persistent storage could not be used
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Error body shape returned by the backend: `{"code": "...", "message": "..."}`
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ApiError {
    /// Build an error from a non-success status and its raw body
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| body.trim().to_string());

        if status == StatusCode::UNAUTHORIZED {
            return ApiError::Unauthorized {
                code: parsed.code,
                message,
            };
        }

        ApiError::Http {
            status: status.as_u16(),
            code: parsed.code,
            message,
        }
    }

    /// True for 401-class failures
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// HTTP status associated with this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Backend error code (e.g. `EMAIL_NOT_VERIFIED`)
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Http { code, .. } | ApiError::Unauthorized { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, ApiError>;
