//! Upstream OAuth 2.0 integration
//!
//! Authorization Code flow with PKCE (RFC 7636) against the upstream
//! authorization server, acting as a confidential client.
//!
//! - [`UpstreamOAuthClient`]: authorization URL, code exchange, refresh grant
//! - [`AuthorizationBridge`]: per-attempt state machine that turns a
//!   successful exchange into a caller session

mod bridge;
mod client;

pub use bridge::{
    AuthorizationBridge, AuthorizationRedirect, BridgeOptions, CallbackParams, DEFAULT_PENDING_TTL,
    ExchangeState, spawn_attempt_sweeper,
};
pub use client::{Pkce, UpstreamOAuthClient};
