//! Upstream credential storage.
//!
//! [`UpstreamCredential`] is what the bridge holds on behalf of one caller
//! session: the upstream access token, optional refresh token, expiry and the
//! scope set granted at the initial exchange. It never crosses the caller
//! boundary.
//!
//! Persistence is pluggable through [`CredentialBackend`]; the
//! [`CredentialStore`] layered on top adds refresh-on-read with at most one
//! refresh in flight per session.

mod file;
mod memory;
mod store;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::scope::ScopeSet;

pub use file::FileCredentialBackend;
pub use memory::InMemoryCredentialBackend;
pub use store::{CredentialStore, spawn_reaper};

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Credential obtained from the upstream token endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCredential {
    /// Access token presented to the upstream resource server
    pub access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Refresh token, when the upstream grant issued one
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Access token expiry (Unix timestamp); `None` never expires
    #[serde(default)]
    pub expires_at: Option<u64>,

    /// Scopes the upstream actually granted
    #[serde(default)]
    pub granted_scopes: ScopeSet,

    /// Expiry of the caller session that owns this entry (Unix timestamp).
    /// Past it, no session credential can reach the entry again.
    #[serde(default)]
    pub session_expires_at: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl UpstreamCredential {
    /// Build a credential from token endpoint fields.
    #[must_use]
    pub fn from_response(
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        granted_scopes: ScopeSet,
    ) -> Self {
        Self {
            access_token,
            token_type: token_type.unwrap_or_else(default_token_type),
            refresh_token,
            expires_at: expires_in.map(|secs| unix_now().saturating_add(secs)),
            granted_scopes,
            session_expires_at: None,
        }
    }

    /// Whether the access token is expired, treating the last `skew` before
    /// expiry as already expired.
    #[must_use]
    pub fn is_expired(&self, skew: Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| unix_now().saturating_add(skew.as_secs()) >= expires_at)
    }

    /// Time until expiration
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = unix_now();
        self.expires_at
            .filter(|&expires_at| expires_at > now)
            .map(|expires_at| Duration::from_secs(expires_at - now))
    }

    /// Last characters of the access token, for log correlation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        token_tail(&self.access_token)
    }
}

impl fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("access_token", &format_args!("…{}", self.fingerprint()))
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("granted_scopes", &self.granted_scopes)
            .field("session_expires_at", &self.session_expires_at)
            .finish()
    }
}

/// Last six characters of a token.
pub(crate) fn token_tail(token: &str) -> String {
    let start = token
        .char_indices()
        .rev()
        .nth(5)
        .map_or(0, |(i, _)| i);
    token[start..].to_string()
}

/// What a refresh may do to the granted-scope set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshScopePolicy {
    /// Keep the scopes captured at the initial exchange.
    #[default]
    Retain,
    /// Intersect with the scopes the refreshed token reports; never widen.
    Narrow,
}

impl RefreshScopePolicy {
    /// Granted scopes after a refresh that reported `reported`.
    #[must_use]
    pub fn apply(self, previous: &ScopeSet, reported: &ScopeSet) -> ScopeSet {
        match self {
            Self::Retain => previous.clone(),
            Self::Narrow => {
                let narrowed: ScopeSet = previous.intersection(reported).cloned().collect();
                if narrowed != *previous {
                    warn!(
                        previous = ?previous,
                        reported = ?reported,
                        "Refreshed token reports narrower scopes; narrowing grant"
                    );
                }
                narrowed
            }
        }
    }
}

/// Persistence contract for upstream credentials, keyed by session id.
///
/// Every method is atomic with respect to a single session: readers never
/// observe a partially written credential.
#[async_trait]
pub trait CredentialBackend: Send + Sync + 'static {
    /// Load the credential for a session.
    async fn load(&self, session_id: &str) -> Result<Option<UpstreamCredential>>;

    /// Insert or overwrite the credential for a session.
    async fn save(&self, session_id: &str, credential: UpstreamCredential) -> Result<()>;

    /// Overwrite only if the stored access token still equals
    /// `previous_access_token`. Returns `false` when the entry is gone or was
    /// replaced by someone else.
    async fn replace(
        &self,
        session_id: &str,
        previous_access_token: &str,
        credential: UpstreamCredential,
    ) -> Result<bool>;

    /// Remove the credential. Returns `true` if it existed.
    async fn remove(&self, session_id: &str) -> Result<bool>;

    /// Drop entries that can no longer be used (see [`is_reapable`]).
    /// Returns the ids of the removed sessions.
    async fn reap(&self, grace: Duration) -> Result<Vec<String>>;
}

/// Produces a replacement for an expired credential (the upstream refresh grant).
#[async_trait]
pub trait CredentialRefresher: Send + Sync + 'static {
    /// Refresh `current`. The result's `granted_scopes` is what the upstream
    /// reported; the store decides what to keep.
    async fn refresh(&self, current: &UpstreamCredential) -> Result<UpstreamCredential>;
}

/// Whether a stored credential is past any chance of being used again:
/// its owning session ended more than `grace` ago, or it cannot be refreshed
/// and its access token expired more than `grace` ago.
pub(crate) fn is_reapable(credential: &UpstreamCredential, grace: Duration) -> bool {
    let now = unix_now();
    let lapsed = |at: u64| at.saturating_add(grace.as_secs()) < now;

    credential.session_expires_at.is_some_and(lapsed)
        || (credential.refresh_token.is_none() && credential.expires_at.is_some_and(lapsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{SEARCH_PROJECT, VIEW_ISSUES, scope_set};

    #[test]
    fn token_expiry_honours_skew() {
        // Token that expires in 1 hour
        let token = UpstreamCredential::from_response(
            "test_token".to_string(),
            None,
            None,
            Some(3600),
            ScopeSet::new(),
        );
        assert!(!token.is_expired(Duration::from_secs(30)));

        // Inside the skew window counts as expired
        let mut soon = token.clone();
        soon.expires_at = Some(unix_now() + 10);
        assert!(soon.is_expired(Duration::from_secs(30)));
        assert!(!soon.is_expired(Duration::ZERO));

        let mut expired = token;
        expired.expires_at = Some(0);
        assert!(expired.is_expired(Duration::ZERO));
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let token = UpstreamCredential::from_response(
            "test_token".to_string(),
            None,
            None,
            None,
            ScopeSet::new(),
        );
        assert!(!token.is_expired(Duration::from_secs(30)));
        assert!(token.time_until_expiry().is_none());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let token = UpstreamCredential::from_response(
            "supersecretaccess123456".to_string(),
            Some("Bearer".to_string()),
            Some("supersecretrefresh".to_string()),
            Some(60),
            scope_set([VIEW_ISSUES]),
        );

        let debug = format!("{token:?}");
        assert!(!debug.contains("supersecretaccess"));
        assert!(!debug.contains("supersecretrefresh"));
        assert!(debug.contains("123456"));
    }

    #[test]
    fn token_tail_handles_short_tokens() {
        assert_eq!(token_tail("abc"), "abc");
        assert_eq!(token_tail("abcdefgh"), "cdefgh");
    }

    #[test]
    fn retain_policy_ignores_reported_scopes() {
        let previous = scope_set([VIEW_ISSUES, SEARCH_PROJECT]);
        let reported = scope_set([VIEW_ISSUES]);
        assert_eq!(RefreshScopePolicy::Retain.apply(&previous, &reported), previous);
    }

    #[test]
    fn narrow_policy_intersects_and_never_widens() {
        let previous = scope_set([VIEW_ISSUES]);
        let reported = scope_set([VIEW_ISSUES, SEARCH_PROJECT]);
        assert_eq!(
            RefreshScopePolicy::Narrow.apply(&previous, &reported),
            scope_set([VIEW_ISSUES])
        );

        let narrower = ScopeSet::new();
        assert!(RefreshScopePolicy::Narrow.apply(&previous, &narrower).is_empty());
    }

    #[test]
    fn reapable_only_without_refresh_token() {
        let mut credential = UpstreamCredential::from_response(
            "a".to_string(),
            None,
            None,
            None,
            ScopeSet::new(),
        );
        credential.expires_at = Some(unix_now() - 120);
        assert!(is_reapable(&credential, Duration::from_secs(60)));
        assert!(!is_reapable(&credential, Duration::from_secs(600)));

        credential.refresh_token = Some("r".to_string());
        assert!(!is_reapable(&credential, Duration::from_secs(60)));
    }

    #[test]
    fn ended_session_is_reapable_even_with_refresh_token() {
        // GIVEN: a refreshable credential whose session ended 30 days ago
        let mut credential = UpstreamCredential::from_response(
            "a".to_string(),
            None,
            Some("r".to_string()),
            None,
            ScopeSet::new(),
        );
        credential.session_expires_at = Some(unix_now() - 30 * 86_400);

        // THEN: it is reapable once past the grace period
        assert!(is_reapable(&credential, Duration::from_secs(3600)));

        // AND: a live session keeps it
        credential.session_expires_at = Some(unix_now() + 3600);
        assert!(!is_reapable(&credential, Duration::from_secs(3600)));
    }

    #[test]
    fn huge_lifetimes_saturate() {
        let credential = UpstreamCredential::from_response(
            "a".to_string(),
            None,
            None,
            Some(u64::MAX),
            ScopeSet::new(),
        );
        assert_eq!(credential.expires_at, Some(u64::MAX));
        assert!(!credential.is_expired(Duration::from_secs(60)));
        assert!(!is_reapable(&credential, Duration::from_secs(u64::MAX)));
    }
}
