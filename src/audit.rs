//! Audit logging for session and credential lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the event serialized as
//! JSON in the `audit` field, so the trail can be extracted by any log
//! aggregator. Tokens never appear in events; at most their last characters.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `session.issued` | An upstream exchange succeeded and a session credential was minted |
//! | `session.revoked` | A session's upstream credential was deleted |
//! | `credential.refreshed` | An expired upstream credential was refreshed |
//! | `credential.refresh_failed` | The upstream refused a refresh |
//! | `exchange.failed` | An authorization callback failed |
//! | `scope.denied` | An operation was refused for insufficient scope |

use serde::Serialize;

use crate::credential::UpstreamCredential;
use crate::scope::ScopeSet;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"session.issued"`)
    pub event: &'static str,
    /// Session the event concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Operation name (for `scope.denied`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Granted scopes (issued) or missing scopes (denied)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Last characters of the upstream access token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_tail: Option<String>,
    /// Upstream access token expiry (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Human-readable reason for failure events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            session_id: None,
            operation: None,
            scopes: None,
            token_tail: None,
            expires_at: None,
            reason: None,
        }
    }

    /// `session.issued`
    #[must_use]
    pub fn session_issued(session_id: &str, credential: &UpstreamCredential) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            scopes: Some(credential.granted_scopes.iter().cloned().collect()),
            token_tail: Some(credential.fingerprint()),
            expires_at: credential.expires_at,
            ..Self::bare("session.issued")
        }
    }

    /// `session.revoked`
    #[must_use]
    pub fn session_revoked(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::bare("session.revoked")
        }
    }

    /// `credential.refreshed`
    #[must_use]
    pub fn refreshed(session_id: &str, credential: &UpstreamCredential) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            token_tail: Some(credential.fingerprint()),
            expires_at: credential.expires_at,
            ..Self::bare("credential.refreshed")
        }
    }

    /// `credential.refresh_failed`
    #[must_use]
    pub fn refresh_failed(session_id: &str, reason: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            reason: Some(reason.into()),
            ..Self::bare("credential.refresh_failed")
        }
    }

    /// `exchange.failed`; no session exists yet at this point.
    #[must_use]
    pub fn exchange_failed(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare("exchange.failed")
        }
    }

    /// `scope.denied`
    #[must_use]
    pub fn scope_denied(session_id: &str, operation: &str, missing: &ScopeSet) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            operation: Some(operation.to_string()),
            scopes: Some(missing.iter().cloned().collect()),
            ..Self::bare("scope.denied")
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO redmine_oauth_bridge::audit audit={"event":"session.issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "credential bridge audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
