//! Redmine OAuth Bridge Library
//!
//! OAuth 2.0 credential bridge between callers and a Redmine instance.
//!
//! # Features
//!
//! - **Scope Registry**: every operation declares the upstream scopes it needs
//! - **Scope Filter**: operators narrow the requested scopes with an allowlist
//! - **Authorization Bridge**: authorization-code + PKCE exchange, granted-scope capture
//! - **Credential Store**: per-session upstream tokens with single-flight refresh
//! - **Enforcement Gate**: per-call scope checks naming exactly the missing scopes
//!
//! Upstream access and refresh tokens never cross the caller boundary; callers
//! hold a short-lived session credential instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod credential;
pub mod error;
pub mod gate;
pub mod oauth;
pub mod operation;
pub mod redmine;
pub mod scope;
pub mod server;
pub mod session;

pub use error::{Error, ErrorKind, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
