//! Caller-facing session credentials.
//!
//! A session credential is a short-lived HS256 JWT whose `sub` is the
//! session identifier keying the credential store. Its lifetime is
//! independent of the upstream access token's.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::{token_tail, unix_now};
use crate::{Error, Result};

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Session token handed to the caller after a successful authorization.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    /// Bearer value presented on every call
    pub token: String,
    /// Session identifier encoded in the token
    pub session_id: String,
    /// Expiry (Unix timestamp)
    pub expires_at: u64,
}

impl SessionCredential {
    /// Seconds until expiry, zero once expired.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        self.expires_at.saturating_sub(unix_now())
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &format_args!("…{}", token_tail(&self.token)))
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Resolves a caller's bearer value to a session identifier.
pub trait SessionResolver: Send + Sync {
    /// Session identifier for `token`, or `Unauthenticated`.
    fn resolve(&self, token: &str) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    iss: String,
    iat: u64,
    exp: u64,
    jti: String,
}

/// Mints and validates session credentials.
pub struct SessionIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl SessionIssuer {
    /// Create an issuer signing with `secret`.
    pub fn new(secret: &[u8], issuer: impl Into<String>, ttl: Duration) -> Result<Self> {
        if secret.len() < 32 {
            return Err(Error::Config(
                "session signing key must be at least 32 bytes".to_string(),
            ));
        }
        let issuer = issuer.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
            ttl,
        })
    }

    /// Session lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a session credential for a freshly created session.
    pub fn issue(&self, session_id: &str) -> Result<SessionCredential> {
        let iat = unix_now();
        let exp = iat + self.ttl.as_secs();
        let claims = SessionClaims {
            sub: session_id.to_string(),
            iss: self.issuer.clone(),
            iat,
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign session credential: {e}")))?;

        Ok(SessionCredential {
            token,
            session_id: session_id.to_string(),
            expires_at: exp,
        })
    }
}

impl SessionResolver for SessionIssuer {
    fn resolve(&self, token: &str) -> Result<String> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Rejected session credential");
                Error::Unauthenticated(format!("invalid session credential: {e}"))
            })?;
        Ok(data.claims.sub)
    }
}

/// Fresh random session identifier.
#[must_use]
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
