//! Error types for the portal session core.
//!
//! This module defines the error hierarchy surfaced to callers of the
//! request gateway and the session manager, plus the configuration and
//! persistence errors of the surrounding plumbing.

use std::path::PathBuf;

/// A specialized `Result` type for portal session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur while establishing or using a portal session.
///
/// Error variants are organized by subsystem and include actionable suggestions
/// where possible to help users resolve issues.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your portal.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Gateway Errors
    // ========================================================================
    /// A gated request waited longer than the queue timeout for the session
    /// to be restored.
    #[error("Session restoration timed out after {waited_ms}ms while '{path}' was queued\n\nSuggestion: Log in again; the stored session could not be restored in time")]
    SessionRestorationTimeout {
        /// Path of the request that expired in the queue.
        path: String,
        /// How long the request waited, in milliseconds.
        waited_ms: u64,
    },

    /// The server rejected the request with 401 after local recovery was
    /// exhausted.
    #[error("Unauthorized: '{path}' was rejected by the server\n\nSuggestion: Log in again")]
    Unauthorized {
        /// Path of the rejected request.
        path: String,
    },

    /// The token renewal call failed or could not be attempted.
    #[error("Token renewal failed: {reason}\n\nSuggestion: Log in again to obtain a fresh token")]
    RenewalFailed {
        /// Why renewal failed.
        reason: String,
    },

    /// Transport-level failure (connection refused, DNS, TLS, timeout).
    #[error("Network error: {message}\n\nSuggestion: Check your network connection and the API base URL")]
    NetworkError {
        /// Description of the transport failure.
        message: String,
    },

    /// The server answered with a non-2xx status other than 401.
    #[error("Server error ({status}) on '{path}': {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Path of the failing request.
        path: String,
        /// Message extracted from the response body, if any.
        message: String,
    },

    /// The server answered 2xx but the body did not have the expected shape.
    #[error("Invalid response from '{path}': {message}")]
    InvalidResponse {
        /// Path of the request.
        path: String,
        /// Description of what was wrong with the body.
        message: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during storage operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `SessionRestorationTimeout` error.
    #[must_use]
    pub fn restoration_timeout(path: impl Into<String>, waited_ms: u64) -> Self {
        Self::SessionRestorationTimeout {
            path: path.into(),
            waited_ms,
        }
    }

    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(path: impl Into<String>) -> Self {
        Self::Unauthorized { path: path.into() }
    }

    /// Creates a new `RenewalFailed` error.
    #[must_use]
    pub fn renewal_failed(reason: impl Into<String>) -> Self {
        Self::RenewalFailed {
            reason: reason.into(),
        }
    }

    /// Creates a new `NetworkError`.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a new `ServerError`.
    #[must_use]
    pub fn server(status: u16, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error is transient and the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError { .. } | Self::SessionRestorationTimeout { .. } => true,
            Self::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the session is unusable and the user has to log in again.
    #[must_use]
    pub const fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. }
                | Self::RenewalFailed { .. }
                | Self::SessionRestorationTimeout { .. }
        )
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}
