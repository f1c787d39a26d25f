//! Fake Redmine (authorization server + REST API) for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;

use redmine_oauth_bridge::config::Config;

/// Client secret the fake token endpoint accepts
pub const CLIENT_SECRET: &str = "bridge-secret";

/// Code exchanged for a long-lived token granting `view_issues`
pub const GOOD_CODE: &str = "good-code";

/// Code exchanged for an already-expired token with a refresh token
pub const STALE_CODE: &str = "stale-code";

/// Observations recorded by the fake upstream.
#[derive(Default)]
pub struct FakeRedmine {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub searches: AtomicUsize,
    pub bearer_tokens: std::sync::Mutex<Vec<String>>,
}

impl FakeRedmine {
    pub fn last_bearer(&self) -> Option<String> {
        self.bearer_tokens.lock().unwrap().last().cloned()
    }
}

/// Start the fake upstream on an ephemeral port. Returns its base URL.
pub async fn spawn_fake_redmine() -> (Arc<FakeRedmine>, String) {
    let fake = Arc::new(FakeRedmine::default());
    let app = Router::new()
        .route("/oauth/token", post(token))
        .route("/issues/{file}", get(issue))
        .route("/search.json", get(search))
        .route("/users/current.json", get(current_user))
        .with_state(Arc::clone(&fake));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (fake, format!("http://{addr}"))
}

/// Bridge configuration pointed at the fake upstream.
pub fn bridge_config(upstream: &str, allowlist: Option<&str>) -> Config {
    let mut config = Config::default();
    config.server.public_url = Some("http://bridge.test".to_string());
    config.upstream.base_url = upstream.to_string();
    config.upstream.client_id = "bridge".to_string();
    config.upstream.client_secret = CLIENT_SECRET.to_string();
    config.upstream.scopes = allowlist.map(str::to_string);
    config.session.signing_key = "integration-test-signing-key-0123456789".to_string();
    config
}

fn oauth_error(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "error_description": "stack trace: db01.internal.example lost connection",
        })),
    )
        .into_response()
}

async fn token(
    State(fake): State<Arc<FakeRedmine>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if form.get("client_secret").map(String::as_str) != Some(CLIENT_SECRET) {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client");
    }

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            if form.get("code_verifier").is_none_or(String::is_empty) {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_request");
            }
            fake.exchanges.fetch_add(1, Ordering::SeqCst);
            match form.get("code").map(String::as_str) {
                Some(GOOD_CODE) => Json(json!({
                    "access_token": "upstream-access-1",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "refresh_token": "upstream-refresh-1",
                    "scope": "view_issues",
                }))
                .into_response(),
                Some(STALE_CODE) => Json(json!({
                    "access_token": "upstream-stale",
                    "token_type": "Bearer",
                    "expires_in": 0,
                    "refresh_token": "upstream-refresh-stale",
                    "scope": "view_issues",
                }))
                .into_response(),
                _ => oauth_error(StatusCode::BAD_REQUEST, "invalid_grant"),
            }
        }
        Some("refresh_token") => {
            let n = fake.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            // Widen the window in which concurrent callers could race.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Json(json!({
                "access_token": format!("upstream-access-refreshed-{n}"),
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "view_issues",
            }))
            .into_response()
        }
        _ => oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type"),
    }
}

fn record_bearer(fake: &FakeRedmine, headers: &HeaderMap) -> bool {
    let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    fake.bearer_tokens.lock().unwrap().push(token.to_string());
    true
}

async fn issue(State(fake): State<Arc<FakeRedmine>>, headers: HeaderMap) -> Response {
    if !record_bearer(&fake, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "issue": { "id": 42, "subject": "Bridge smoke test" } })).into_response()
}

async fn search(State(fake): State<Arc<FakeRedmine>>, headers: HeaderMap) -> Response {
    fake.searches.fetch_add(1, Ordering::SeqCst);
    record_bearer(&fake, &headers);
    Json(json!({ "results": [], "total_count": 0 })).into_response()
}

async fn current_user(State(fake): State<Arc<FakeRedmine>>, headers: HeaderMap) -> Response {
    record_bearer(&fake, &headers);
    Json(json!({ "user": { "id": 7, "login": "jsmith" } })).into_response()
}
