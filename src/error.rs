//! Error types for the credential bridge

use std::collections::BTreeSet;
use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the credential bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Credential bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// An operation name was registered twice
    #[error("Operation already registered: {0}")]
    DuplicateRegistration(String),

    /// Registration attempted after the registry was frozen
    #[error("Scope registry is frozen; cannot register {0}")]
    RegistryFrozen(String),

    /// The bridge or gate was built over a registry that still accepts registrations
    #[error("Scope registry must be frozen before {0} is constructed")]
    RegistryNotFrozen(&'static str),

    /// Operation name not present in the registry
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Callback `state` did not match any pending authorization attempt
    #[error("Authorization state mismatch")]
    StateMismatch,

    /// Upstream code-for-token exchange failed
    #[error("Upstream exchange failed: {0}")]
    UpstreamExchangeFailed(String),

    /// No upstream credential stored for the session
    #[error("No upstream credential for session")]
    NoCredential,

    /// Upstream refused to refresh the credential
    #[error("Credential refresh failed: {0}")]
    RefreshFailed(String),

    /// Caller session could not be resolved
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// The upstream grant does not cover the operation
    #[error(
        "Operation '{operation}' requires OAuth scope(s): {}. Please re-authorize with the required permissions.",
        join_scopes(missing)
    )]
    InsufficientScope {
        /// Operation that was refused
        operation: String,
        /// Required scopes absent from the grant
        missing: BTreeSet<String>,
    },

    /// Operation arguments could not be decoded
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Upstream resource server returned an error status
    #[error("Upstream API error {status}: {message}")]
    UpstreamApi {
        /// HTTP status returned by the upstream
        status: u16,
        /// Caller-safe message
        message: String,
    },

    /// The bridge is at capacity; the caller may retry later
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_scopes(scopes: &BTreeSet<String>) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Stable, caller-facing error categories.
///
/// Everything crossing the caller boundary is collapsed into one of these so
/// that upstream internals are never forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Authorization flow failed; the caller should retry it
    AuthorizationFailed,
    /// Session missing, expired, revoked or not refreshable
    Unauthenticated,
    /// Grant narrower than the operation needs
    InsufficientScope,
    /// No such operation
    UnknownOperation,
    /// Bad operation arguments
    InvalidArguments,
    /// Upstream resource server failure
    UpstreamError,
    /// Temporarily over capacity
    Unavailable,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Wire name used in JSON error bodies
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationFailed => "authorization_failed",
            Self::Unauthenticated => "invalid_token",
            Self::InsufficientScope => "insufficient_scope",
            Self::UnknownOperation => "unknown_operation",
            Self::InvalidArguments => "invalid_request",
            Self::UpstreamError => "upstream_error",
            Self::Unavailable => "temporarily_unavailable",
            Self::Internal => "server_error",
        }
    }

    /// HTTP status for this kind
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::AuthorizationFailed | Self::InvalidArguments => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope => StatusCode::FORBIDDEN,
            Self::UnknownOperation => StatusCode::NOT_FOUND,
            Self::UpstreamError => StatusCode::BAD_GATEWAY,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Error {
    /// Collapse into the caller-facing category
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StateMismatch | Self::UpstreamExchangeFailed(_) => ErrorKind::AuthorizationFailed,
            Self::NoCredential | Self::RefreshFailed(_) | Self::Unauthenticated(_) => {
                ErrorKind::Unauthenticated
            }
            Self::InsufficientScope { .. } => ErrorKind::InsufficientScope,
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::InvalidArguments(_) => ErrorKind::InvalidArguments,
            Self::UpstreamApi { .. } | Self::Http(_) => ErrorKind::UpstreamError,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Upstream exchange and refresh causes are replaced with a fixed text;
    /// the detailed cause is only logged.
    #[must_use]
    pub fn caller_message(&self) -> String {
        match self {
            Self::StateMismatch | Self::UpstreamExchangeFailed(_) => {
                "Authorization failed, please retry the OAuth flow.".to_string()
            }
            Self::NoCredential | Self::RefreshFailed(_) | Self::Unauthenticated(_) => {
                "Not authenticated. Please complete the OAuth flow first.".to_string()
            }
            Self::InsufficientScope { .. }
            | Self::UnknownOperation(_)
            | Self::InvalidArguments(_)
            | Self::UpstreamApi { .. } => self.to_string(),
            Self::Http(_) => "Upstream request failed.".to_string(),
            Self::Unavailable(_) => "Too many authorizations in progress, retry shortly.".to_string(),
            _ => "Internal error.".to_string(),
        }
    }

    /// Missing scopes for `InsufficientScope`, `None` otherwise
    #[must_use]
    pub fn missing_scopes(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::InsufficientScope { missing, .. } => Some(missing),
            _ => None,
        }
    }
}
