//! HTTP handlers
//!
//! Every failure leaves through [`ApiError`], which renders the stable
//! caller-facing error kind and never the upstream's own error text.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::{AppState, SESSION_ID_HEADER};
use crate::Error;
use crate::error::ErrorKind;
use crate::gate::{SessionContext, missing_scopes};
use crate::oauth::CallbackParams;
use crate::scope::format_scope_list;

/// Error rendered as an OAuth-style JSON body.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(&self.0)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Render `err` for the caller.
pub(super) fn error_response(err: &Error) -> Response {
    let kind = err.kind();
    match kind {
        ErrorKind::Internal => error!(error = %err, "Request failed"),
        ErrorKind::UpstreamError => warn!(error = %err, "Upstream call failed"),
        _ => debug!(error = %err, "Request refused"),
    }

    let mut body = json!({
        "error": kind.as_str(),
        "error_description": err.caller_message(),
    });
    if let Some(missing) = err.missing_scopes() {
        body["missing_scopes"] = json!(missing);
    }

    let mut response = (kind.status(), Json(body)).into_response();
    let challenge = match kind {
        ErrorKind::Unauthenticated => Some(r#"Bearer error="invalid_token""#.to_string()),
        ErrorKind::InsufficientScope => err.missing_scopes().map(|missing| {
            format!(
                r#"Bearer error="insufficient_scope", scope="{}""#,
                format_scope_list(missing)
            )
        }),
        _ => None,
    };
    if let Some(value) = challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// Session for the bearer value in `Authorization`.
fn session(state: &AppState, headers: &HeaderMap) -> ApiResult<SessionContext> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let Some(token) = token else {
        return Err(Error::Unauthenticated(
            "Missing Authorization header. Use: Authorization: Bearer <token>".to_string(),
        )
        .into());
    };
    Ok(state.gate.resolve(token)?)
}

/// GET /health
pub(super) async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "operations": state.gate.catalog().len(),
        "pending_authorizations": state.bridge.pending_attempts(),
    }))
}

/// GET /oauth/authorize - redirect to the upstream authorization endpoint
pub(super) async fn authorize(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let redirect = state.bridge.begin_authorization()?;
    let location = HeaderValue::from_str(redirect.url.as_str())
        .map_err(|e| Error::Internal(format!("Invalid authorization URL: {e}")))?;

    debug!(exchange_id = %redirect.exchange_id, "Redirecting to upstream authorization");
    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, location),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
    )
        .into_response())
}

/// GET {redirect_path} - upstream redirect target
pub(super) async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Response> {
    let session = state.bridge.handle_callback_params(&params).await?;
    let session_id = HeaderValue::from_str(&session.session_id)
        .map_err(|e| Error::Internal(format!("Invalid session id: {e}")))?;

    Ok((
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (header::HeaderName::from_static(SESSION_ID_HEADER), session_id),
        ],
        Json(json!({
            "access_token": session.token,
            "token_type": "Bearer",
            "expires_in": session.expires_in(),
        })),
    )
        .into_response())
}

/// GET /operations - catalog with the caller's grant
pub(super) async fn list_operations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = session(&state, &headers)?;
    let granted = state.gate.granted_scopes(&ctx).await?;

    let operations: Vec<Value> = state
        .gate
        .catalog()
        .capabilities()
        .into_iter()
        .map(|cap| {
            let missing = missing_scopes(&cap.scopes, &granted);
            json!({
                "name": cap.name,
                "description": cap.description,
                "kind": cap.kind,
                "required_scopes": cap.scopes,
                "missing_scopes": missing,
                "authorized": missing.is_empty(),
            })
        })
        .collect();

    Ok(Json(json!({
        "operations": operations,
        "effective_scopes": state.bridge.effective_scopes(),
        "granted_scopes": granted,
    })))
}

/// POST /operations/{name}
pub(super) async fn invoke_operation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let ctx = session(&state, &headers)?;
    let args = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidArguments(format!("request body is not JSON: {e}")))?
    };

    let result = state.gate.invoke_in_session(&ctx, &name, args).await?;
    Ok(Json(result))
}

/// DELETE /session - revoke the caller's upstream credential
pub(super) async fn revoke_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let ctx = session(&state, &headers)?;
    state.gate.revoke(&ctx).await?;
    info!(session_id = %ctx.session_id, "Session revoked by caller");
    Ok(StatusCode::NO_CONTENT)
}
