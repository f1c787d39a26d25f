//! Redmine OAuth Bridge - scoped Redmine operations behind an OAuth 2.0
//! credential bridge.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use redmine_oauth_bridge::{
    cli::{Cli, Command},
    config::Config,
    redmine::{RedmineClient, build_http_client},
    scope::{effective_scopes, format_scope_list},
    server, setup_tracing,
};

/// Placeholder upstream for listing scopes without a configured Redmine
const UNCONFIGURED_UPSTREAM: &str = "http://redmine.invalid/";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply_overrides(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Scopes { ref format }) => print_scopes(&config, format),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Print every operation's scope requirement and the effective scope set
fn print_scopes(config: &Config, format: &str) -> ExitCode {
    let base_url = if config.upstream.base_url.is_empty() {
        UNCONFIGURED_UPSTREAM
    } else {
        config.upstream.base_url.as_str()
    };
    let catalog = match build_http_client(config.upstream.timeout)
        .and_then(|http| RedmineClient::new(http, base_url))
        .and_then(|client| server::build_catalog(&client))
    {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("❌ Failed to register operations: {e}");
            return ExitCode::FAILURE;
        }
    };

    let registry = catalog.registry();
    let declared = registry.declared_scopes();
    let allowlist = config.upstream.scope_allowlist();
    let effective = effective_scopes(&declared, allowlist.as_ref());

    if format == "json" {
        let operations: Vec<_> = registry
            .requirements()
            .into_iter()
            .map(|r| serde_json::json!({ "operation": r.operation, "scopes": r.scopes }))
            .collect();
        let doc = serde_json::json!({
            "operations": operations,
            "declared_scopes": declared,
            "effective_scopes": effective,
        });
        match serde_json::to_string_pretty(&doc) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("❌ Failed to serialize to JSON: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    println!("{} operation(s):\n", registry.len());
    for requirement in registry.requirements() {
        let scopes = if requirement.scopes.is_empty() {
            "(none)".to_string()
        } else {
            format_scope_list(&requirement.scopes)
        };
        println!("  {:<24} {scopes}", requirement.operation);
    }
    println!();
    println!("Declared scopes:  {}", format_scope_list(&declared));
    println!("Effective scopes: {}", format_scope_list(&effective));

    let excluded: Vec<_> = declared.difference(&effective).cloned().collect();
    if !excluded.is_empty() {
        println!(
            "\n💡 Operations needing {} will be refused until the allowlist includes them",
            excluded.join(", ")
        );
    }
    ExitCode::SUCCESS
}

/// Run the bridge server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        upstream = %config.upstream.base_url,
        "Starting Redmine OAuth Bridge"
    );

    if let Err(e) = server::run(config).await {
        error!("Bridge error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
