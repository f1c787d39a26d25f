//! In-memory credential backend backed by a `DashMap`.
//!
//! Each session lives in its own map entry, so operations on different
//! sessions only ever share a shard lock for the duration of a clone.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CredentialBackend, UpstreamCredential, is_reapable};
use crate::Result;

/// Process-local credential storage. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCredentialBackend {
    by_session: DashMap<String, UpstreamCredential>,
}

impl InMemoryCredentialBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    /// `true` when no session is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}

#[async_trait]
impl CredentialBackend for InMemoryCredentialBackend {
    async fn load(&self, session_id: &str) -> Result<Option<UpstreamCredential>> {
        Ok(self.by_session.get(session_id).map(|entry| entry.clone()))
    }

    async fn save(&self, session_id: &str, credential: UpstreamCredential) -> Result<()> {
        self.by_session.insert(session_id.to_string(), credential);
        Ok(())
    }

    async fn replace(
        &self,
        session_id: &str,
        previous_access_token: &str,
        credential: UpstreamCredential,
    ) -> Result<bool> {
        let Some(mut entry) = self.by_session.get_mut(session_id) else {
            return Ok(false);
        };
        if entry.access_token != previous_access_token {
            return Ok(false);
        }
        *entry = credential;
        Ok(true)
    }

    async fn remove(&self, session_id: &str) -> Result<bool> {
        Ok(self.by_session.remove(session_id).is_some())
    }

    async fn reap(&self, grace: Duration) -> Result<Vec<String>> {
        let mut reaped = Vec::new();
        self.by_session.retain(|session_id, credential| {
            let keep = !is_reapable(credential, grace);
            if !keep {
                reaped.push(session_id.clone());
            }
            keep
        });
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "Reaped expired in-memory credentials");
        }
        Ok(reaped)
    }
}
