//! Enforcement gate: per-call scope enforcement around every operation.
//!
//! Each invocation:
//!
//! 1. resolves the caller's session from its session credential,
//! 2. fetches the upstream credential, refreshing it when expired,
//! 3. checks the operation's required scopes against the granted set,
//! 4. runs the operation with a copy of the upstream access token.
//!
//! No lock is held while the operation runs. Credential-lifecycle failures
//! surface as `Unauthenticated`; an insufficient grant names exactly the
//! missing scopes.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::credential::{CredentialRefresher, CredentialStore, UpstreamCredential};
use crate::operation::{OperationCatalog, UpstreamToken};
use crate::scope::ScopeSet;
use crate::session::SessionResolver;
use crate::{Error, Result};

/// Session resolved for one call, threaded through explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Credential store key
    pub session_id: String,
}

/// Wraps registered operations with session resolution and scope checks.
pub struct EnforcementGate {
    catalog: Arc<OperationCatalog>,
    store: CredentialStore,
    resolver: Arc<dyn SessionResolver>,
    refresher: Arc<dyn CredentialRefresher>,
}

impl EnforcementGate {
    /// Build a gate over a frozen catalog.
    pub fn new(
        catalog: Arc<OperationCatalog>,
        store: CredentialStore,
        resolver: Arc<dyn SessionResolver>,
        refresher: Arc<dyn CredentialRefresher>,
    ) -> Result<Self> {
        if !catalog.registry().is_frozen() {
            return Err(Error::RegistryNotFrozen("the enforcement gate"));
        }
        Ok(Self {
            catalog,
            store,
            resolver,
            refresher,
        })
    }

    /// Operation catalog
    #[must_use]
    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    /// Resolve a session credential to its session.
    pub fn resolve(&self, session_token: &str) -> Result<SessionContext> {
        let session_id = self.resolver.resolve(session_token)?;
        Ok(SessionContext { session_id })
    }

    /// Resolve `session_token` and invoke `operation`.
    pub async fn invoke(&self, session_token: &str, operation: &str, args: Value) -> Result<Value> {
        let ctx = self.resolve(session_token)?;
        self.invoke_in_session(&ctx, operation, args).await
    }

    /// Invoke `operation` for an already-resolved session.
    pub async fn invoke_in_session(
        &self,
        ctx: &SessionContext,
        operation: &str,
        args: Value,
    ) -> Result<Value> {
        let credential = self.credential(ctx).await?;

        let capability = self.catalog.get(operation)?;
        let missing = missing_scopes(&capability.scopes, &credential.granted_scopes);
        if !missing.is_empty() {
            warn!(operation = %operation, missing = ?missing, "Operation refused: insufficient scope");
            audit::emit(&AuditEvent::scope_denied(&ctx.session_id, operation, &missing));
            return Err(Error::InsufficientScope {
                operation: operation.to_string(),
                missing,
            });
        }

        debug!(operation = %operation, "Invoking operation");
        let token = UpstreamToken::new(credential.access_token);
        capability.handler.call(token, args).await
    }

    /// Scopes granted to the session, without refreshing.
    pub async fn granted_scopes(&self, ctx: &SessionContext) -> Result<ScopeSet> {
        self.store
            .get(&ctx.session_id)
            .await
            .map(|credential| credential.granted_scopes)
            .map_err(unauthenticated)
    }

    /// Revoke the session's upstream credential.
    pub async fn revoke(&self, ctx: &SessionContext) -> Result<()> {
        self.store.delete(&ctx.session_id).await
    }

    async fn credential(&self, ctx: &SessionContext) -> Result<UpstreamCredential> {
        let refresher = Arc::clone(&self.refresher);
        self.store
            .refresh_if_expired(&ctx.session_id, move |current| async move {
                refresher.refresh(&current).await
            })
            .await
            .map_err(unauthenticated)
    }
}

/// `required − granted`
#[must_use]
pub fn missing_scopes(required: &ScopeSet, granted: &ScopeSet) -> ScopeSet {
    required.difference(granted).cloned().collect()
}

fn unauthenticated(err: Error) -> Error {
    match err {
        Error::NoCredential => {
            Error::Unauthenticated("no upstream credential for this session".to_string())
        }
        Error::RefreshFailed(cause) => {
            Error::Unauthenticated(format!("upstream credential could not be refreshed: {cause}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::credential::{InMemoryCredentialBackend, unix_now};
    use crate::operation::{Capability, operation_fn};
    use crate::scope::{SEARCH_PROJECT, VIEW_ISSUES, VIEW_PROJECT, scope_set};

    /// Treats `session:<id>` as a valid session credential.
    struct PrefixResolver;

    impl SessionResolver for PrefixResolver {
        fn resolve(&self, token: &str) -> Result<String> {
            token
                .strip_prefix("session:")
                .map(str::to_string)
                .ok_or_else(|| Error::Unauthenticated("bad token".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self, current: &UpstreamCredential) -> Result<UpstreamCredential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::RefreshFailed("invalid_grant".to_string()));
            }
            let mut fresh = current.clone();
            fresh.access_token = "refreshed".to_string();
            fresh.expires_at = Some(unix_now() + 3600);
            Ok(fresh)
        }
    }

    fn catalog() -> Arc<OperationCatalog> {
        let mut catalog = OperationCatalog::new();
        let echo_token =
            || operation_fn(|token: UpstreamToken, _args| async move { Ok(json!(token.secret())) });
        catalog
            .register(Capability::tool("fetch_issue", "", scope_set([VIEW_ISSUES]), echo_token()))
            .unwrap();
        catalog
            .register(Capability::tool(
                "search_issues",
                "",
                scope_set([VIEW_ISSUES, SEARCH_PROJECT]),
                echo_token(),
            ))
            .unwrap();
        catalog
            .register(Capability::resource("current_user", "", ScopeSet::new(), echo_token()))
            .unwrap();
        catalog.freeze();
        Arc::new(catalog)
    }

    fn credential(granted: ScopeSet, expires_at: u64) -> UpstreamCredential {
        UpstreamCredential {
            access_token: "upstream".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(expires_at),
            granted_scopes: granted,
            session_expires_at: None,
        }
    }

    fn gate_with(refresher: Arc<CountingRefresher>) -> (EnforcementGate, CredentialStore) {
        let store = CredentialStore::new(Arc::new(InMemoryCredentialBackend::new()));
        let gate = EnforcementGate::new(catalog(), store.clone(), Arc::new(PrefixResolver), refresher)
            .unwrap();
        (gate, store)
    }

    #[tokio::test]
    async fn granted_operation_runs_with_upstream_token() {
        // GIVEN: a session granted view_issues
        let (gate, store) = gate_with(Arc::default());
        store
            .put("s1", credential(scope_set([VIEW_ISSUES]), unix_now() + 3600))
            .await
            .unwrap();

        // WHEN: fetch_issue is invoked
        let out = gate.invoke("session:s1", "fetch_issue", json!({})).await.unwrap();

        // THEN: the handler saw the upstream token
        assert_eq!(out, json!("upstream"));
    }

    #[tokio::test]
    async fn insufficient_scope_names_missing_set() {
        let (gate, store) = gate_with(Arc::default());
        store
            .put("s1", credential(scope_set([VIEW_ISSUES]), unix_now() + 3600))
            .await
            .unwrap();

        let err = gate
            .invoke("session:s1", "search_issues", json!({}))
            .await
            .unwrap_err();

        assert_eq!(err.missing_scopes(), Some(&scope_set([SEARCH_PROJECT])));
        assert!(err.to_string().contains("search_project"));
    }

    #[tokio::test]
    async fn permits_iff_required_is_subset_of_granted() {
        let universe = [VIEW_ISSUES, SEARCH_PROJECT, VIEW_PROJECT];
        let pick = |mask: u8| -> ScopeSet {
            universe
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, s)| (*s).to_string())
                .collect()
        };

        for g in 0u8..8 {
            let granted = pick(g);
            let (gate, store) = gate_with(Arc::default());
            store
                .put("s", credential(granted.clone(), unix_now() + 3600))
                .await
                .unwrap();

            for op in ["fetch_issue", "search_issues", "current_user"] {
                let required = gate.catalog().get(op).unwrap().scopes.clone();
                let result = gate.invoke("session:s", op, json!({})).await;
                if required.is_subset(&granted) {
                    assert!(result.is_ok(), "{op} should pass with {granted:?}");
                } else {
                    let err = result.unwrap_err();
                    let expected: ScopeSet = required.difference(&granted).cloned().collect();
                    assert_eq!(err.missing_scopes(), Some(&expected));
                }
            }
        }
    }

    #[tokio::test]
    async fn unresolvable_session_is_unauthenticated() {
        let (gate, _store) = gate_with(Arc::default());
        let err = gate.invoke("nonsense", "fetch_issue", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let (gate, _store) = gate_with(Arc::default());
        let err = gate
            .invoke("session:never", "fetch_issue", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed_transparently() {
        let refresher = Arc::new(CountingRefresher::default());
        let (gate, store) = gate_with(Arc::clone(&refresher));
        store
            .put("s1", credential(scope_set([VIEW_ISSUES]), unix_now() - 1))
            .await
            .unwrap();

        let out = gate.invoke("session:s1", "fetch_issue", json!({})).await.unwrap();

        assert_eq!(out, json!("refreshed"));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_failure_is_unauthenticated() {
        let refresher = Arc::new(CountingRefresher {
            fail: true,
            ..CountingRefresher::default()
        });
        let (gate, store) = gate_with(refresher);
        store
            .put("s1", credential(scope_set([VIEW_ISSUES]), unix_now() - 1))
            .await
            .unwrap();

        let err = gate.invoke("session:s1", "fetch_issue", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn unknown_operation() {
        let (gate, store) = gate_with(Arc::default());
        store
            .put("s1", credential(ScopeSet::new(), unix_now() + 3600))
            .await
            .unwrap();

        let err = gate.invoke("session:s1", "nope", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn revoked_session_is_unauthenticated() {
        let (gate, store) = gate_with(Arc::default());
        store
            .put("s1", credential(scope_set([VIEW_ISSUES]), unix_now() + 3600))
            .await
            .unwrap();
        let ctx = gate.resolve("session:s1").unwrap();

        gate.revoke(&ctx).await.unwrap();

        let err = gate.invoke_in_session(&ctx, "fetch_issue", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
        assert!(gate.granted_scopes(&ctx).await.is_err());
    }

    #[test]
    fn unfrozen_catalog_is_rejected() {
        let store = CredentialStore::new(Arc::new(InMemoryCredentialBackend::new()));
        let result = EnforcementGate::new(
            Arc::new(OperationCatalog::new()),
            store,
            Arc::new(PrefixResolver),
            Arc::new(CountingRefresher::default()),
        );
        assert!(matches!(result, Err(Error::RegistryNotFrozen(_))));
    }
}
