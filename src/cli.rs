//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// OAuth 2.0 credential bridge for Redmine
#[derive(Parser, Debug)]
#[command(name = "redmine-oauth-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OAUTH_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_HOST")]
    pub host: Option<String>,

    /// Externally visible base URL of the bridge
    #[arg(long, env = "MCP_BASE_URL")]
    pub base_url: Option<String>,

    /// Redmine instance URL
    #[arg(long, env = "REDMINE_URL", global = true)]
    pub redmine_url: Option<String>,

    /// OAuth client id registered in Redmine
    #[arg(long, env = "REDMINE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret registered in Redmine
    #[arg(long, env = "REDMINE_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Space-separated scope allowlist
    #[arg(long, env = "REDMINE_SCOPES", global = true)]
    pub scopes: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OAUTH_BRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OAUTH_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the bridge server (default)
    Serve,

    /// Print every operation with its required scopes and the effective
    /// scope set that would be requested
    Scopes {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

impl Cli {
    /// Apply command-line and environment overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }
        if let Some(ref url) = self.base_url {
            config.server.public_url = Some(url.clone());
        }
        if let Some(ref url) = self.redmine_url {
            config.upstream.base_url.clone_from(url);
        }
        if let Some(ref id) = self.client_id {
            config.upstream.client_id.clone_from(id);
        }
        if let Some(ref secret) = self.client_secret {
            config.upstream.client_secret.clone_from(secret);
        }
        if let Some(ref scopes) = self.scopes {
            config.upstream.scopes = Some(scopes.clone());
        }
    }
}
