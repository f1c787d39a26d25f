//! Upstream OAuth client
//!
//! Confidential-client side of the authorization-code grant: builds the
//! upstream authorization URL and talks to the token endpoint for the code
//! exchange and refresh grants.

use std::fmt;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::credential::{CredentialRefresher, UpstreamCredential};
use crate::scope::{ScopeSet, format_scope_list, parse_scope_list};
use crate::{Error, Result};

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// OAuth error document (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// PKCE verifier/challenge pair
#[derive(Clone)]
pub struct Pkce {
    /// Secret verifier, sent with the code exchange
    pub verifier: String,
    /// S256 challenge, sent with the authorization request
    pub challenge: String,
}

impl fmt::Debug for Pkce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkce")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Client for the upstream authorization server
pub struct UpstreamOAuthClient {
    /// HTTP client for token requests
    http_client: Client,

    authorization_endpoint: Url,
    token_endpoint: Url,

    client_id: String,
    client_secret: String,

    /// Where the upstream sends the browser back to
    redirect_uri: String,
}

impl UpstreamOAuthClient {
    /// Create a client for the configured upstream.
    pub fn new(http_client: Client, upstream: &UpstreamConfig, redirect_uri: String) -> Result<Self> {
        Ok(Self {
            http_client,
            authorization_endpoint: upstream.authorization_endpoint()?,
            token_endpoint: upstream.token_endpoint()?,
            client_id: upstream.client_id.clone(),
            client_secret: upstream.resolved_client_secret()?,
            redirect_uri,
        })
    }

    /// Redirect URI registered with the upstream
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Upstream authorization URL for one attempt.
    #[must_use]
    pub fn authorization_url(&self, scopes: &ScopeSet, state: &str, pkce: Option<&Pkce>) -> Url {
        let mut url = self.authorization_endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("state", state);

            if let Some(pkce) = pkce {
                params.append_pair("code_challenge", &pkce.challenge);
                params.append_pair("code_challenge_method", "S256");
            }

            if !scopes.is_empty() {
                params.append_pair("scope", &format_scope_list(scopes));
            }
        }
        url
    }

    /// Exchange an authorization code for an upstream credential.
    ///
    /// `requested` is the effective scope set of the attempt; it becomes the
    /// grant when the token response carries no `scope` field.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        requested: &ScopeSet,
    ) -> Result<UpstreamCredential> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }

        let response = self
            .token_request(&params)
            .await
            .map_err(Error::UpstreamExchangeFailed)?;

        let granted = parse_scope_list(response.scope.as_deref()).unwrap_or_else(|| {
            debug!("Token response carries no scope; assuming requested scopes were granted");
            requested.clone()
        });
        if !granted.is_subset(requested) {
            // Upstream granted something we never asked for; keep it as reported
            debug!(granted = ?granted, requested = ?requested, "Upstream granted unrequested scopes");
        }

        let credential = UpstreamCredential::from_response(
            response.access_token,
            response.token_type,
            response.refresh_token,
            response.expires_in,
            granted,
        );
        info!(
            token = %format_args!("…{}", credential.fingerprint()),
            granted = %format_scope_list(&credential.granted_scopes),
            "Upstream authorization code exchanged"
        );
        Ok(credential)
    }

    /// Run the refresh grant for `current`.
    ///
    /// The returned credential's `granted_scopes` holds what the upstream
    /// reported, or the current grant when it reported nothing; the store's
    /// refresh scope policy decides what is kept. A missing rotated refresh
    /// token means the old one stays valid.
    pub async fn refresh(&self, current: &UpstreamCredential) -> Result<UpstreamCredential> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::RefreshFailed("no refresh token issued".to_string()))?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .token_request(&params)
            .await
            .map_err(Error::RefreshFailed)?;

        let reported = parse_scope_list(response.scope.as_deref())
            .unwrap_or_else(|| current.granted_scopes.clone());

        Ok(UpstreamCredential::from_response(
            response.access_token,
            response.token_type,
            response.refresh_token.or_else(|| current.refresh_token.clone()),
            response.expires_in,
            reported,
        ))
    }

    /// POST a form to the token endpoint.
    ///
    /// Errors are returned as a short cause string; upstream bodies are only
    /// logged.
    async fn token_request(&self, params: &[(&str, &str)]) -> std::result::Result<TokenResponse, String> {
        let response = self
            .http_client
            .post(self.token_endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Token endpoint request failed");
                format!("token request failed: {e}")
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            warn!(error = %e, "Failed to read token endpoint response");
            format!("failed to read token response: {e}")
        })?;

        if !status.is_success() {
            warn!(status = %status, body = %body, "Token endpoint returned an error");
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => {
                    if let Some(description) = err.error_description {
                        debug!(description = %description, "Upstream error description");
                    }
                    format!("HTTP {status}: {}", err.error)
                }
                Err(_) => format!("HTTP {status}"),
            });
        }

        serde_json::from_str::<TokenResponse>(&body).map_err(|e| {
            warn!(error = %e, "Failed to parse token response");
            format!("malformed token response: {e}")
        })
    }
}

#[async_trait]
impl CredentialRefresher for UpstreamOAuthClient {
    async fn refresh(&self, current: &UpstreamCredential) -> Result<UpstreamCredential> {
        UpstreamOAuthClient::refresh(self, current).await
    }
}

impl fmt::Debug for UpstreamOAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamOAuthClient")
            .field("authorization_endpoint", &self.authorization_endpoint.as_str())
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Generate PKCE code verifier and challenge
pub(crate) fn generate_pkce() -> Pkce {
    // 32 random bytes -> 43-char verifier
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    Pkce { verifier, challenge }
}

/// Generate a random state parameter
pub(crate) fn generate_state() -> String {
    let state_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
