//! Scope pipeline through the public API: registration, allowlist
//! filtering, exchange, capture and per-call enforcement.

mod common;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use common::{GOOD_CODE, bridge_config, spawn_fake_redmine};
use redmine_oauth_bridge::{
    Error,
    credential::{CredentialBackend, CredentialStore, InMemoryCredentialBackend, UpstreamCredential},
    gate::EnforcementGate,
    oauth::{AuthorizationBridge, BridgeOptions, UpstreamOAuthClient},
    operation::{Capability, OperationCatalog, operation_fn},
    redmine::build_http_client,
    scope::{SEARCH_PROJECT, VIEW_ISSUES, scope_set},
    session::SessionIssuer,
};

struct Harness {
    bridge: AuthorizationBridge,
    gate: EnforcementGate,
    calls: Arc<AtomicUsize>,
}

fn harness(upstream: &str, allowlist: Option<&str>) -> Harness {
    harness_with(upstream, allowlist, Arc::new(InMemoryCredentialBackend::new()))
}

fn harness_with(
    upstream: &str,
    allowlist: Option<&str>,
    backend: Arc<dyn CredentialBackend>,
) -> Harness {
    let config = bridge_config(upstream, allowlist);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut catalog = OperationCatalog::new();
    for (name, scopes) in [
        ("fetch_issue", scope_set([VIEW_ISSUES])),
        ("search_issues", scope_set([VIEW_ISSUES, SEARCH_PROJECT])),
    ] {
        let calls = Arc::clone(&calls);
        let handler = operation_fn(move |_token, args: Value| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "echo": args }))
            }
        });
        catalog
            .register(Capability::tool(name, "test operation", scopes, handler))
            .unwrap();
    }
    catalog.freeze();
    let catalog = Arc::new(catalog);

    let store = CredentialStore::new(backend);
    let issuer = Arc::new(
        SessionIssuer::new(
            config.session.signing_key.as_bytes(),
            "redmine-oauth-bridge",
            config.session.ttl,
        )
        .unwrap(),
    );
    let http = build_http_client(config.upstream.timeout).unwrap();
    let client = Arc::new(
        UpstreamOAuthClient::new(http, &config.upstream, "http://bridge.test/oauth/callback".to_string())
            .unwrap(),
    );

    let bridge = AuthorizationBridge::new(
        catalog.registry(),
        config.upstream.scope_allowlist().as_ref(),
        Arc::clone(&client),
        store.clone(),
        Arc::clone(&issuer),
        BridgeOptions::default(),
    )
    .unwrap();
    let gate = EnforcementGate::new(catalog, store, issuer, client).unwrap();

    Harness { bridge, gate, calls }
}

fn state_of(url: &url::Url) -> String {
    url.query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

#[tokio::test]
async fn allowlist_narrows_request_and_gate_names_missing_scope() {
    // GIVEN: fetch_issue {view_issues}, search_issues {view_issues, search_project},
    // and an allowlist of view_issues only
    let (_fake, upstream) = spawn_fake_redmine().await;
    let h = harness(&upstream, Some("view_issues"));

    // THEN: only view_issues is requested upstream
    assert_eq!(h.bridge.effective_scopes(), &scope_set([VIEW_ISSUES]));

    // WHEN: the exchange grants exactly view_issues
    let redirect = h.bridge.begin_authorization().unwrap();
    let session = h
        .bridge
        .handle_callback(GOOD_CODE, &state_of(&redirect.url))
        .await
        .unwrap();

    // THEN: fetch_issue succeeds
    let result = h
        .gate
        .invoke(&session.token, "fetch_issue", json!({"id": 1}))
        .await
        .unwrap();
    assert_eq!(result["echo"]["id"], 1);

    // AND: search_issues fails naming exactly search_project, without running
    let err = h
        .gate
        .invoke(&session.token, "search_issues", json!({}))
        .await
        .unwrap_err();
    match err {
        Error::InsufficientScope { operation, missing } => {
            assert_eq!(operation, "search_issues");
            assert_eq!(missing, scope_set([SEARCH_PROJECT]));
        }
        other => panic!("expected InsufficientScope, got {other:?}"),
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn without_allowlist_every_declared_scope_is_requested() {
    let (_fake, upstream) = spawn_fake_redmine().await;
    let h = harness(&upstream, None);

    let redirect = h.bridge.begin_authorization().unwrap();
    let scope = redirect
        .url
        .query_pairs()
        .find(|(k, _)| k == "scope")
        .map(|(_, v)| v.into_owned());

    assert_eq!(scope.as_deref(), Some("search_project view_issues"));
}

#[tokio::test]
async fn sessions_are_isolated() {
    // GIVEN: two sessions from two exchanges
    let (_fake, upstream) = spawn_fake_redmine().await;
    let h = harness(&upstream, None);
    let first = h.bridge.begin_authorization().unwrap();
    let second = h.bridge.begin_authorization().unwrap();
    let a = h.bridge.handle_callback(GOOD_CODE, &state_of(&first.url)).await.unwrap();
    let b = h.bridge.handle_callback(GOOD_CODE, &state_of(&second.url)).await.unwrap();
    assert_ne!(a.session_id, b.session_id);

    // WHEN: one session is revoked
    let ctx = h.gate.resolve(&a.token).unwrap();
    h.gate.revoke(&ctx).await.unwrap();

    // THEN: the other still works
    assert!(matches!(
        h.gate.invoke(&a.token, "fetch_issue", Value::Null).await,
        Err(Error::Unauthenticated(_))
    ));
    assert!(h.gate.invoke(&b.token, "fetch_issue", Value::Null).await.is_ok());
}

/// Backend whose writes always fail.
struct ReadOnlyBackend;

#[async_trait]
impl CredentialBackend for ReadOnlyBackend {
    async fn load(&self, _: &str) -> redmine_oauth_bridge::Result<Option<UpstreamCredential>> {
        Ok(None)
    }

    async fn save(&self, _: &str, _: UpstreamCredential) -> redmine_oauth_bridge::Result<()> {
        Err(Error::Internal("credential storage is read-only".to_string()))
    }

    async fn replace(&self, _: &str, _: &str, _: UpstreamCredential) -> redmine_oauth_bridge::Result<bool> {
        Ok(false)
    }

    async fn remove(&self, _: &str) -> redmine_oauth_bridge::Result<bool> {
        Ok(false)
    }

    async fn reap(&self, _: Duration) -> redmine_oauth_bridge::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Log sink shared with a test subscriber.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn session_issued_is_audited_only_once_stored() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);
    let (_fake, upstream) = spawn_fake_redmine().await;

    // GIVEN: a bridge whose credential storage rejects writes
    let h = harness_with(&upstream, None, Arc::new(ReadOnlyBackend));
    let redirect = h.bridge.begin_authorization().unwrap();

    // WHEN: the upstream exchange succeeds but storing the credential fails
    let err = h
        .bridge
        .handle_callback(GOOD_CODE, &state_of(&redirect.url))
        .await
        .unwrap_err();

    // THEN: no session is handed out and none is audited
    assert!(matches!(err, Error::Internal(_)));
    assert!(!logs.contents().contains("session.issued"));

    // AND: with working storage the same flow is audited
    let h = harness(&upstream, None);
    let redirect = h.bridge.begin_authorization().unwrap();
    h.bridge
        .handle_callback(GOOD_CODE, &state_of(&redirect.url))
        .await
        .unwrap();
    assert!(logs.contents().contains("session.issued"));
}

#[tokio::test]
async fn tampered_session_token_is_rejected() {
    let (_fake, upstream) = spawn_fake_redmine().await;
    let h = harness(&upstream, None);
    let redirect = h.bridge.begin_authorization().unwrap();
    let session = h.bridge.handle_callback(GOOD_CODE, &state_of(&redirect.url)).await.unwrap();

    let mut forged = session.token.clone();
    forged.push('x');

    assert!(matches!(
        h.gate.invoke(&forged, "fetch_issue", Value::Null).await,
        Err(Error::Unauthenticated(_))
    ));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}
