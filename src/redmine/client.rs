//! Redmine REST client
//!
//! Stateless with respect to authentication: every request carries the
//! caller's upstream token, supplied by the enforcement gate.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::operation::UpstreamToken;
use crate::{Error, Result};

/// Build the shared HTTP client used for upstream calls.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}

/// Thin client over the Redmine REST API.
#[derive(Debug, Clone)]
pub struct RedmineClient {
    http_client: Client,
    base_url: Url,
}

impl RedmineClient {
    /// Create a client for the Redmine instance at `base_url`.
    pub fn new(http_client: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid Redmine URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("Invalid Redmine URL '{base_url}'")));
        }
        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// URL for `segments` below the base URL. Each segment is percent-encoded.
    pub fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Internal("Redmine URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON document.
    pub async fn get(
        &self,
        segments: &[&str],
        token: &UpstreamToken,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let url = self.url(segments)?;
        debug!(path = %url.path(), "Redmine GET");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(token.secret())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response.json().await?)
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    warn!(status = %status, body = %body, "Redmine request failed");
    let message = match status {
        StatusCode::UNAUTHORIZED => "Authentication failed, token may be expired.".to_string(),
        StatusCode::FORBIDDEN => "Permission denied.".to_string(),
        StatusCode::NOT_FOUND => "Resource not found in Redmine.".to_string(),
        s if s.is_server_error() => format!("Redmine server error ({}).", s.as_u16()),
        s => format!("Redmine request failed ({}).", s.as_u16()),
    };
    Error::UpstreamApi {
        status: status.as_u16(),
        message,
    }
}
