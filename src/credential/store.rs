//! Credential store: refresh-on-read over a [`CredentialBackend`].
//!
//! # Refresh coordination
//!
//! Callers read credentials without locking. Only when a read observes an
//! expired access token does the caller take the session's refresh lock,
//! re-read (someone may have refreshed meanwhile) and, if still expired, run
//! the refresh. Concurrent callers for the same session queue on that lock
//! and pick up the fresh credential, so the upstream sees a single refresh
//! per expiry. Sessions never share a refresh lock.
//!
//! The refresh runs on its own task: if the caller goes away mid-refresh the
//! exchange still completes and is stored, and only the result is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CredentialBackend, RefreshScopePolicy, UpstreamCredential};
use crate::audit::{self, AuditEvent};
use crate::{Error, Result};

/// Default clock-skew tolerance applied to expiry checks.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);

struct StoreInner {
    backend: Arc<dyn CredentialBackend>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    clock_skew: Duration,
    scope_policy: RefreshScopePolicy,
}

/// Session-keyed upstream credential store.
///
/// Cheap to clone; clones share the same backend and refresh locks.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    /// Create a store with the default clock skew and scope policy.
    #[must_use]
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self::with_options(backend, DEFAULT_CLOCK_SKEW, RefreshScopePolicy::default())
    }

    /// Create a store with explicit refresh options.
    #[must_use]
    pub fn with_options(
        backend: Arc<dyn CredentialBackend>,
        clock_skew: Duration,
        scope_policy: RefreshScopePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                refresh_locks: DashMap::new(),
                clock_skew,
                scope_policy,
            }),
        }
    }

    /// Insert or replace the credential for a session.
    pub async fn put(&self, session_id: &str, credential: UpstreamCredential) -> Result<()> {
        self.inner.backend.save(session_id, credential).await
    }

    /// Current credential for a session, expired or not.
    pub async fn get(&self, session_id: &str) -> Result<UpstreamCredential> {
        self.inner.get(session_id).await
    }

    /// Remove a session's credential. Later reads fail with `NoCredential`.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let existed = self.inner.backend.remove(session_id).await?;
        self.inner.refresh_locks.remove(session_id);
        if existed {
            audit::emit(&AuditEvent::session_revoked(session_id));
        }
        Ok(())
    }

    /// Drop dead entries from the backend and forget their refresh locks.
    /// Returns how many sessions were reaped.
    pub async fn reap(&self, grace: Duration) -> Result<usize> {
        let reaped = self.inner.backend.reap(grace).await?;
        for session_id in &reaped {
            // A queued refresh still holds a clone; it will find no entry
            self.inner
                .refresh_locks
                .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
        }
        Ok(reaped.len())
    }

    /// Return a usable credential, refreshing it first when expired.
    ///
    /// `refresh` is called at most once per expiry event, however many
    /// callers race on the same session. On failure the stale entry is kept
    /// and `RefreshFailed` is returned so the caller can re-authorize.
    pub async fn refresh_if_expired<F, Fut>(
        &self,
        session_id: &str,
        refresh: F,
    ) -> Result<UpstreamCredential>
    where
        F: FnOnce(UpstreamCredential) -> Fut + Send + 'static,
        Fut: Future<Output = Result<UpstreamCredential>> + Send + 'static,
    {
        let current = self.inner.get(session_id).await?;
        if !current.is_expired(self.inner.clock_skew) {
            return Ok(current);
        }

        let inner = Arc::clone(&self.inner);
        let session = session_id.to_string();
        tokio::spawn(async move { inner.refresh_locked(&session, refresh).await })
            .await
            .map_err(|e| Error::Internal(format!("Refresh task failed: {e}")))?
    }
}

impl StoreInner {
    async fn get(&self, session_id: &str) -> Result<UpstreamCredential> {
        self.backend
            .load(session_id)
            .await?
            .ok_or(Error::NoCredential)
    }

    fn refresh_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn refresh_locked<F, Fut>(&self, session_id: &str, refresh: F) -> Result<UpstreamCredential>
    where
        F: FnOnce(UpstreamCredential) -> Fut,
        Fut: Future<Output = Result<UpstreamCredential>>,
    {
        let lock = self.refresh_lock(session_id);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may already have refreshed
        let current = self.get(session_id).await?;
        if !current.is_expired(self.clock_skew) {
            debug!("Credential refreshed by a concurrent caller");
            return Ok(current);
        }

        let previous_token = current.access_token.clone();
        let previous_scopes = current.granted_scopes.clone();
        let session_expires_at = current.session_expires_at;

        let mut fresh = match refresh(current).await {
            Ok(fresh) => fresh,
            Err(e) => {
                let reason = match e {
                    Error::RefreshFailed(reason) => reason,
                    other => other.to_string(),
                };
                warn!(error = %reason, "Upstream credential refresh failed; keeping stale entry");
                audit::emit(&AuditEvent::refresh_failed(session_id, &reason));
                return Err(Error::RefreshFailed(reason));
            }
        };
        fresh.granted_scopes = self
            .scope_policy
            .apply(&previous_scopes, &fresh.granted_scopes);
        fresh.session_expires_at = session_expires_at;

        if self
            .backend
            .replace(session_id, &previous_token, fresh.clone())
            .await?
        {
            info!(
                token = %format_args!("…{}", fresh.fingerprint()),
                expires_in = ?fresh.time_until_expiry(),
                "Upstream credential refreshed"
            );
            audit::emit(&AuditEvent::refreshed(session_id, &fresh));
            Ok(fresh)
        } else {
            // Revoked or re-authorized while the refresh was in flight
            debug!("Credential changed during refresh; discarding refreshed token");
            self.get(session_id).await
        }
    }
}

/// Spawn a background task that reaps dead credentials every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: CredentialStore,
    interval: Duration,
    grace: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.reap(grace).await {
                        Ok(0) => {}
                        Ok(reaped) => debug!(count = reaped, "Reaped dead upstream credentials"),
                        Err(e) => warn!(error = %e, "Credential reaper pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Credential reaper shutting down");
                    break;
                }
            }
        }
    });
}
