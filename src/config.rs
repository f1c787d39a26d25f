//! Configuration management

use std::{env, fmt, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::RefreshScopePolicy;
use crate::scope::{ScopeSet, parse_scope_list};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// HTTP server
    pub server: ServerConfig,
    /// Upstream authorization and resource server
    pub upstream: UpstreamConfig,
    /// Caller session credentials
    pub session: SessionConfig,
    /// Upstream credential storage
    pub credentials: CredentialsConfig,
    /// Authorization attempts
    pub exchange: ExchangeConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // OAUTH_BRIDGE_UPSTREAM__CLIENT_ID -> upstream.client_id
        figment = figment.merge(Env::prefixed("OAUTH_BRIDGE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first so ${VAR} can refer to them
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("Invalid expansion pattern: {e}")))?;

        for value in [
            &mut self.upstream.base_url,
            &mut self.upstream.client_id,
            &mut self.upstream.client_secret,
            &mut self.session.signing_key,
        ] {
            *value = expand_string(&re, value);
        }
        for value in [
            &mut self.server.public_url,
            &mut self.upstream.scopes,
            &mut self.credentials.directory,
        ]
        .into_iter()
        .flatten()
        {
            *value = expand_string(&re, value);
        }
        Ok(())
    }

    /// Check everything needed to start, before anything starts.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(Error::Config(
                "upstream.base_url is required (REDMINE_URL)".to_string(),
            ));
        }
        self.upstream.authorization_endpoint()?;
        self.upstream.token_endpoint()?;
        if self.upstream.client_id.trim().is_empty() {
            return Err(Error::Config(
                "upstream.client_id is required (REDMINE_CLIENT_ID)".to_string(),
            ));
        }
        if self.upstream.resolved_client_secret()?.is_empty() {
            return Err(Error::Config(
                "upstream.client_secret is required (REDMINE_CLIENT_SECRET)".to_string(),
            ));
        }
        if !self.upstream.redirect_path.starts_with('/') {
            return Err(Error::Config(format!(
                "upstream.redirect_path must start with '/': {}",
                self.upstream.redirect_path
            )));
        }
        if RESERVED_PATHS.contains(&self.upstream.redirect_path.as_str()) {
            return Err(Error::Config(format!(
                "upstream.redirect_path collides with a built-in route: {}",
                self.upstream.redirect_path
            )));
        }
        self.server.redirect_uri(&self.upstream.redirect_path)?;
        if self.session.ttl.is_zero() {
            return Err(Error::Config("session.ttl must be positive".to_string()));
        }
        if self.credentials.reap_interval.is_zero() {
            return Err(Error::Config(
                "credentials.reap_interval must be positive".to_string(),
            ));
        }
        if self.exchange.max_pending == 0 {
            return Err(Error::Config("exchange.max_pending must be positive".to_string()));
        }
        Ok(())
    }
}

/// Routes the server defines itself
const RESERVED_PATHS: &[&str] = &["/health", "/oauth/authorize", "/operations", "/session"];

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Resolve a secret written as a literal or `env:VAR_NAME`.
fn resolve_secret(value: &str, field: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name)
            .map_err(|_| Error::Config(format!("{field}: environment variable {var_name} is not set"))),
        None => Ok(value.to_string()),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (`MCP_BASE_URL`); defaults to `http://localhost:{port}`
    pub public_url: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            public_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Public base URL without a trailing slash
    #[must_use]
    pub fn public_base_url(&self) -> String {
        self.public_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map_or_else(
                || format!("http://localhost:{}", self.port),
                |u| u.trim_end_matches('/').to_string(),
            )
    }

    /// Absolute redirect URI registered with the upstream
    pub fn redirect_uri(&self, redirect_path: &str) -> Result<String> {
        let uri = format!("{}{redirect_path}", self.public_base_url());
        Url::parse(&uri).map_err(|e| Error::Config(format!("Invalid redirect URI '{uri}': {e}")))?;
        Ok(uri)
    }
}

/// Upstream (Redmine) configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the Redmine instance (`REDMINE_URL`)
    pub base_url: String,
    /// OAuth client identifier (`REDMINE_CLIENT_ID`)
    pub client_id: String,
    /// OAuth client secret (`REDMINE_CLIENT_SECRET`); literal or `env:VAR_NAME`
    pub client_secret: String,
    /// Authorization endpoint path below `base_url`
    pub authorize_path: String,
    /// Token endpoint path below `base_url`
    pub token_path: String,
    /// Path of the bridge's callback route
    pub redirect_path: String,
    /// Optional space-separated scope allowlist (`REDMINE_SCOPES`)
    pub scopes: Option<String>,
    /// Send a PKCE challenge with the authorization request
    pub pkce: bool,
    /// Timeout for upstream HTTP calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            authorize_path: "/oauth/authorize".to_string(),
            token_path: "/oauth/token".to_string(),
            redirect_path: "/oauth/callback".to_string(),
            scopes: None,
            pkce: true,
            timeout: Duration::from_secs(30),
        }
    }
}

impl UpstreamConfig {
    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}{path}", self.base_url.trim_end_matches('/'));
        Url::parse(&raw).map_err(|e| Error::Config(format!("Invalid upstream URL '{raw}': {e}")))
    }

    /// Upstream authorization endpoint
    pub fn authorization_endpoint(&self) -> Result<Url> {
        self.endpoint(&self.authorize_path)
    }

    /// Upstream token endpoint
    pub fn token_endpoint(&self) -> Result<Url> {
        self.endpoint(&self.token_path)
    }

    /// Client secret with `env:` references resolved
    pub fn resolved_client_secret(&self) -> Result<String> {
        resolve_secret(&self.client_secret, "upstream.client_secret")
    }

    /// Operator scope allowlist; `None` when unset or blank
    #[must_use]
    pub fn scope_allowlist(&self) -> Option<ScopeSet> {
        parse_scope_list(self.scopes.as_deref())
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authorize_path", &self.authorize_path)
            .field("token_path", &self.token_path)
            .field("redirect_path", &self.redirect_path)
            .field("scopes", &self.scopes)
            .field("pkce", &self.pkce)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Session credential configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HS256 signing key.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (random per process)
    pub signing_key: String,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// `iss` claim
    pub issuer: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: "auto".to_string(),
            ttl: Duration::from_secs(3600),
            issuer: "redmine-oauth-bridge".to_string(),
        }
    }
}

impl SessionConfig {
    /// Resolve the signing key (expand env vars, generate if `auto`)
    pub fn resolve_signing_key(&self) -> Result<Vec<u8>> {
        if self.signing_key == "auto" {
            use rand::Rng;
            tracing::warn!("Using a random session signing key; sessions will not survive a restart");
            let key: [u8; 32] = rand::rng().random();
            return Ok(key.to_vec());
        }
        Ok(resolve_secret(&self.signing_key, "session.signing_key")?.into_bytes())
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.signing_key == "auto" || self.signing_key.starts_with("env:") {
            self.signing_key.as_str()
        } else {
            "<redacted>"
        };
        f.debug_struct("SessionConfig")
            .field("signing_key", &key)
            .field("ttl", &self.ttl)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// Credential storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackendKind {
    /// Process memory; lost on restart
    #[default]
    Memory,
    /// One JSON file per session
    File,
}

/// Upstream credential storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Storage backend
    pub backend: CredentialBackendKind,
    /// Directory for the file backend; defaults to `~/.redmine-oauth-bridge/credentials`
    pub directory: Option<String>,
    /// Treat tokens this close to expiry as expired
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// What a refresh may do to granted scopes
    pub refresh_scope_policy: RefreshScopePolicy,
    /// How often dead credentials are reaped
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// How long after expiry an unrefreshable credential is kept
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend: CredentialBackendKind::Memory,
            directory: None,
            clock_skew: Duration::from_secs(30),
            refresh_scope_policy: RefreshScopePolicy::Retain,
            reap_interval: Duration::from_secs(300),
            grace_period: Duration::from_secs(3600),
        }
    }
}

impl CredentialsConfig {
    /// Directory for the file backend, `~` expanded
    #[must_use]
    pub fn directory_path(&self) -> Option<PathBuf> {
        self.directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| PathBuf::from(expand_home(d)))
    }
}

/// Authorization attempt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// How long a started authorization may wait for its callback
    #[serde(with = "humantime_serde")]
    pub pending_ttl: Duration,
    /// Most authorizations allowed to wait for a callback at once
    pub max_pending: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(600),
            max_pending: 1024,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{VIEW_ISSUES, scope_set};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn valid() -> Config {
        Config {
            upstream: UpstreamConfig {
                base_url: "https://redmine.example.com".to_string(),
                client_id: "bridge".to_string(),
                client_secret: "secret".to_string(),
                ..UpstreamConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "OAUTH_BRIDGE_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("OAUTH_BRIDGE_TEST_KEY_A").unwrap(), "hello_from_env_file");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn expand_string_uses_env_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("expand.env");
        std::fs::write(&env_path, "OAUTH_BRIDGE_TEST_HOST=redmine.internal\n").unwrap();
        dotenvy::from_path(&env_path).unwrap();

        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        assert_eq!(
            expand_string(&re, "https://${OAUTH_BRIDGE_TEST_HOST}/"),
            "https://redmine.internal/"
        );
        assert_eq!(
            expand_string(&re, "${OAUTH_BRIDGE_TEST_UNSET:-fallback}"),
            "fallback"
        );
    }

    #[test]
    fn yaml_sections_deserialize() {
        let yaml = r#"
server:
  port: 9000
  public_url: "https://bridge.example.com/"
upstream:
  base_url: "https://redmine.example.com"
  client_id: "bridge"
  client_secret: "env:REDMINE_CLIENT_SECRET"
  scopes: "view_issues"
credentials:
  backend: file
  directory: "/var/lib/bridge"
  refresh_scope_policy: narrow
  clock_skew: 10s
exchange:
  pending_ttl: 5m
  max_pending: 64
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.credentials.backend, CredentialBackendKind::File);
        assert_eq!(config.credentials.refresh_scope_policy, RefreshScopePolicy::Narrow);
        assert_eq!(config.credentials.clock_skew, Duration::from_secs(10));
        assert_eq!(config.exchange.pending_ttl, Duration::from_secs(300));
        assert_eq!(config.exchange.max_pending, 64);
        assert_eq!(config.upstream.scope_allowlist(), Some(scope_set([VIEW_ISSUES])));
        assert_eq!(
            config.server.redirect_uri(&config.upstream.redirect_path).unwrap(),
            "https://bridge.example.com/oauth/callback"
        );
    }

    #[test]
    fn defaults_follow_environment_conventions() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.public_base_url(), "http://localhost:8000");
        assert_eq!(config.session.signing_key, "auto");
        assert_eq!(config.credentials.backend, CredentialBackendKind::Memory);
        assert!(config.upstream.pkce);
    }

    #[test]
    fn endpoints_join_base_and_paths() {
        let mut config = valid();
        config.upstream.base_url = "https://redmine.example.com/".to_string();

        assert_eq!(
            config.upstream.authorization_endpoint().unwrap().as_str(),
            "https://redmine.example.com/oauth/authorize"
        );
        assert_eq!(
            config.upstream.token_endpoint().unwrap().as_str(),
            "https://redmine.example.com/oauth/token"
        );
    }

    #[test]
    fn validate_requires_upstream_credentials() {
        assert!(valid().validate().is_ok());

        let mut missing_url = valid();
        missing_url.upstream.base_url.clear();
        assert!(matches!(missing_url.validate(), Err(Error::Config(m)) if m.contains("REDMINE_URL")));

        let mut missing_id = valid();
        missing_id.upstream.client_id.clear();
        assert!(matches!(missing_id.validate(), Err(Error::Config(m)) if m.contains("REDMINE_CLIENT_ID")));

        let mut missing_secret = valid();
        missing_secret.upstream.client_secret.clear();
        assert!(missing_secret.validate().is_err());

        let mut clashing = valid();
        clashing.upstream.redirect_path = "/health".to_string();
        assert!(clashing.validate().is_err());

        let mut unset_env = valid();
        unset_env.upstream.client_secret = "env:OAUTH_BRIDGE_TEST_NEVER_SET".to_string();
        assert!(unset_env.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        // GIVEN: a reaper that would tick every zero seconds
        let mut config = valid();
        config.credentials.reap_interval = Duration::ZERO;

        // THEN: validation refuses it before anything is spawned
        assert!(matches!(
            config.validate(),
            Err(Error::Config(m)) if m.contains("reap_interval")
        ));

        let mut config = valid();
        config.exchange.max_pending = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::Config(m)) if m.contains("max_pending")
        ));
    }

    #[test]
    fn blank_allowlist_is_absent() {
        let mut config = valid();
        config.upstream.scopes = Some("   ".to_string());
        assert_eq!(config.upstream.scope_allowlist(), None);
    }

    #[test]
    fn signing_key_auto_and_literal() {
        let auto = SessionConfig::default().resolve_signing_key().unwrap();
        assert_eq!(auto.len(), 32);

        let literal = SessionConfig {
            signing_key: "k".repeat(40),
            ..SessionConfig::default()
        };
        assert_eq!(literal.resolve_signing_key().unwrap().len(), 40);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = valid();
        config.session.signing_key = "super-secret-signing-key".to_string();
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-signing-key"));
        assert!(!debug.contains("\"secret\""));
    }

    #[test]
    fn humantime_parses_units() {
        #[derive(Deserialize)]
        struct D {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let parse = |s: &str| serde_yaml::from_str::<D>(&format!("d: \"{s}\"")).unwrap().d;

        assert_eq!(parse("100ms"), Duration::from_millis(100));
        assert_eq!(parse("30s"), Duration::from_secs(30));
        assert_eq!(parse("5m"), Duration::from_secs(300));
        assert_eq!(parse("1h"), Duration::from_secs(3600));
        assert_eq!(parse("45"), Duration::from_secs(45));
    }
}
