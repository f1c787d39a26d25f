//! Authorization bridge
//!
//! Drives the upstream authorization-code exchange for one attempt at a
//! time and turns a successful exchange into a caller session:
//!
//! ```text
//! Initiated ──▶ AwaitingUpstreamCallback ──▶ Exchanging ──▶ Completed
//!     │                  │                       │
//!     └──────────────────┴───────────────────────┴──▶ Failed
//! ```
//!
//! Pending attempts are indexed by a digest of their `state` value, so a
//! callback finds its attempt without a timing-dependent string comparison;
//! the stored state is then compared in constant time. An attempt is removed
//! on its first callback, so a replayed callback fails `StateMismatch`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use super::client::{Pkce, UpstreamOAuthClient, generate_pkce, generate_state};
use crate::audit::{self, AuditEvent};
use crate::credential::CredentialStore;
use crate::scope::{ScopeRegistry, ScopeSet, effective_scopes, format_scope_list};
use crate::session::{SessionCredential, SessionIssuer, new_session_id};
use crate::{Error, Result};

/// Default lifetime of a pending authorization attempt.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);

/// Default cap on attempts waiting for a callback.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Lifecycle of one authorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Attempt created, URL not yet handed out
    Initiated,
    /// Browser sent to the upstream; waiting for the callback
    AwaitingUpstreamCallback,
    /// Callback accepted; code exchange in flight
    Exchanging,
    /// Session issued
    Completed,
    /// Terminal failure
    Failed,
}

impl ExchangeState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExchangeState::{AwaitingUpstreamCallback, Completed, Exchanging, Failed, Initiated};
        matches!(
            (self, next),
            (Initiated, AwaitingUpstreamCallback)
                | (AwaitingUpstreamCallback, Exchanging)
                | (Exchanging, Completed)
                | (Initiated | AwaitingUpstreamCallback | Exchanging, Failed)
        )
    }

    /// `Completed` or `Failed`
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::AwaitingUpstreamCallback => "awaiting_upstream_callback",
            Self::Exchanging => "exchanging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One in-flight authorization attempt.
struct AuthorizationAttempt {
    /// Transient exchange identifier (for logs)
    exchange_id: String,
    state_value: String,
    pkce: Option<Pkce>,
    created_at: Instant,
    status: ExchangeState,
}

impl AuthorizationAttempt {
    fn transition(&mut self, next: ExchangeState) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal exchange transition {} -> {next}",
                self.status
            )));
        }
        debug!(exchange_id = %self.exchange_id, from = %self.status, to = %next, "Exchange transition");
        self.status = next;
        Ok(())
    }

    /// Record a failure and hand back `err`.
    fn fail(&mut self, err: Error) -> Error {
        if !self.status.is_terminal() {
            self.status = ExchangeState::Failed;
        }
        warn!(exchange_id = %self.exchange_id, error = %err, "Authorization attempt failed");
        audit::emit(&AuditEvent::exchange_failed(err.to_string()));
        err
    }
}

/// Where to send the caller's browser to start authorization.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    /// Upstream authorization URL
    pub url: Url,
    /// Exchange identifier of the attempt
    pub exchange_id: String,
}

/// Query parameters of the upstream redirect back to the bridge
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// State parameter
    pub state: Option<String>,
    /// Error code (upstream refused or the user denied)
    pub error: Option<String>,
    /// Error description
    pub error_description: Option<String>,
}

/// Bridge tuning
#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    /// Pending attempt lifetime
    pub pending_ttl: Duration,
    /// Send a PKCE challenge upstream
    pub pkce: bool,
    /// Most attempts allowed to wait for a callback at once
    pub max_pending: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            pending_ttl: DEFAULT_PENDING_TTL,
            pkce: true,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Upstream authorization-code exchange and session issuance.
pub struct AuthorizationBridge {
    client: Arc<UpstreamOAuthClient>,
    store: CredentialStore,
    issuer: Arc<SessionIssuer>,
    effective: ScopeSet,
    pending: DashMap<String, AuthorizationAttempt>,
    options: BridgeOptions,
}

impl AuthorizationBridge {
    /// Build the bridge over a frozen registry.
    ///
    /// The effective scope set is computed here, once.
    pub fn new(
        registry: &ScopeRegistry,
        allowlist: Option<&ScopeSet>,
        client: Arc<UpstreamOAuthClient>,
        store: CredentialStore,
        issuer: Arc<SessionIssuer>,
        options: BridgeOptions,
    ) -> Result<Self> {
        if !registry.is_frozen() {
            return Err(Error::RegistryNotFrozen("the authorization bridge"));
        }

        let declared = registry.declared_scopes();
        let effective = effective_scopes(&declared, allowlist);
        if effective.len() < declared.len() {
            let excluded: ScopeSet = declared.difference(&effective).cloned().collect();
            warn!(
                excluded = %format_scope_list(&excluded),
                "Scope allowlist excludes declared scopes; operations needing them will be refused"
            );
        }
        info!(scopes = %format_scope_list(&effective), "Effective upstream scopes");

        Ok(Self {
            client,
            store,
            issuer,
            effective,
            pending: DashMap::new(),
            options,
        })
    }

    /// Scopes requested from the upstream
    #[must_use]
    pub fn effective_scopes(&self) -> &ScopeSet {
        &self.effective
    }

    /// Number of attempts waiting for a callback
    #[must_use]
    pub fn pending_attempts(&self) -> usize {
        self.pending.len()
    }

    /// Start an authorization attempt.
    ///
    /// Fails with `Unavailable` while `max_pending` live attempts are
    /// already waiting for their callback.
    pub fn begin_authorization(&self) -> Result<AuthorizationRedirect> {
        if self.pending.len() >= self.options.max_pending {
            self.sweep_expired_attempts();
            if self.pending.len() >= self.options.max_pending {
                warn!(
                    pending = self.pending.len(),
                    "Pending authorization limit reached; refusing new attempt"
                );
                return Err(Error::Unavailable(
                    "pending authorization limit reached".to_string(),
                ));
            }
        }

        let mut attempt = AuthorizationAttempt {
            exchange_id: uuid::Uuid::new_v4().to_string(),
            state_value: generate_state(),
            pkce: self.options.pkce.then(generate_pkce),
            created_at: Instant::now(),
            status: ExchangeState::Initiated,
        };

        let url = self
            .client
            .authorization_url(&self.effective, &attempt.state_value, attempt.pkce.as_ref());
        attempt.transition(ExchangeState::AwaitingUpstreamCallback)?;

        let exchange_id = attempt.exchange_id.clone();
        self.pending
            .insert(state_digest(&attempt.state_value), attempt);

        debug!(exchange_id = %exchange_id, "Authorization attempt started");
        Ok(AuthorizationRedirect { url, exchange_id })
    }

    /// Complete an attempt with the `code` and `state` from the upstream redirect.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<SessionCredential> {
        self.complete(state, Ok(code)).await
    }

    /// Complete an attempt from raw callback query parameters.
    ///
    /// The state is checked first, even when the upstream reported an error.
    pub async fn handle_callback_params(&self, params: &CallbackParams) -> Result<SessionCredential> {
        let Some(state) = params.state.as_deref() else {
            audit::emit(&AuditEvent::exchange_failed("callback without state"));
            return Err(Error::StateMismatch);
        };

        let outcome = match (&params.error, &params.code) {
            (Some(error), _) => Err(match &params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            }),
            (None, Some(code)) => Ok(code.as_str()),
            (None, None) => Err("callback without code".to_string()),
        };
        self.complete(state, outcome).await
    }

    async fn complete(
        &self,
        state: &str,
        outcome: std::result::Result<&str, String>,
    ) -> Result<SessionCredential> {
        let mut attempt = self.take_attempt(state)?;
        attempt.transition(ExchangeState::Exchanging)?;

        let code = match outcome {
            Ok(code) => code,
            Err(cause) => return Err(attempt.fail(Error::UpstreamExchangeFailed(cause))),
        };

        let verifier = attempt.pkce.as_ref().map(|p| p.verifier.as_str());
        let mut credential = match self.client.exchange_code(code, verifier, &self.effective).await {
            Ok(credential) => credential,
            Err(e) => return Err(attempt.fail(e)),
        };

        let session_id = new_session_id();
        let session = match self.issuer.issue(&session_id) {
            Ok(session) => session,
            Err(e) => return Err(attempt.fail(e)),
        };
        credential.session_expires_at = Some(session.expires_at);
        let issued = AuditEvent::session_issued(&session_id, &credential);
        if let Err(e) = self.store.put(&session_id, credential).await {
            return Err(attempt.fail(e));
        }
        audit::emit(&issued);

        attempt.transition(ExchangeState::Completed)?;
        info!(exchange_id = %attempt.exchange_id, "Authorization completed; session issued");
        Ok(session)
    }

    /// Remove and return the pending attempt matching `state`.
    fn take_attempt(&self, state: &str) -> Result<AuthorizationAttempt> {
        let Some((_, mut attempt)) = self.pending.remove(&state_digest(state)) else {
            audit::emit(&AuditEvent::exchange_failed("unknown or replayed state"));
            return Err(Error::StateMismatch);
        };

        if !bool::from(attempt.state_value.as_bytes().ct_eq(state.as_bytes())) {
            return Err(attempt.fail(Error::StateMismatch));
        }
        if attempt.created_at.elapsed() > self.options.pending_ttl {
            debug!(exchange_id = %attempt.exchange_id, "Authorization attempt expired");
            return Err(attempt.fail(Error::StateMismatch));
        }
        Ok(attempt)
    }

    /// Drop attempts older than the pending TTL. Returns how many were removed.
    pub fn sweep_expired_attempts(&self) -> usize {
        let before = self.pending.len();
        let ttl = self.options.pending_ttl;
        self.pending
            .retain(|_, attempt| attempt.created_at.elapsed() <= ttl);
        let swept = before.saturating_sub(self.pending.len());
        if swept > 0 {
            debug!(count = swept, "Swept expired authorization attempts");
        }
        swept
    }
}

fn state_digest(state: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(state.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Spawn a background task sweeping expired attempts every `interval`.
pub fn spawn_attempt_sweeper(
    bridge: Arc<AuthorizationBridge>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    bridge.sweep_expired_attempts();
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}
