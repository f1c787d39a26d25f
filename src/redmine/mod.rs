//! Redmine as the upstream resource server.
//!
//! [`RedmineClient`] wraps the REST API; [`register_operations`] registers
//! the read-only tools and resources together with the OAuth scopes each
//! one needs.

mod client;
mod tools;

pub use client::{RedmineClient, build_http_client};
pub use tools::register_operations;
