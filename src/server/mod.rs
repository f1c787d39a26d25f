//! HTTP surface of the bridge
//!
//! Wires configuration into the authorization bridge and the enforcement
//! gate, then serves them over axum until a shutdown signal arrives.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderName, StatusCode},
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::config::{Config, CredentialBackendKind};
use crate::credential::{
    CredentialBackend, CredentialStore, FileCredentialBackend, InMemoryCredentialBackend,
    spawn_reaper,
};
use crate::gate::EnforcementGate;
use crate::oauth::{AuthorizationBridge, BridgeOptions, UpstreamOAuthClient, spawn_attempt_sweeper};
use crate::operation::OperationCatalog;
use crate::redmine::{RedmineClient, build_http_client, register_operations};
use crate::scope::format_scope_list;
use crate::session::SessionIssuer;
use crate::{Error, Result};

/// Session header exposed to browser callers
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Shared application state
pub struct AppState {
    /// Authorization-code flow
    pub bridge: Arc<AuthorizationBridge>,
    /// Per-call scope enforcement
    pub gate: Arc<EnforcementGate>,
    /// Upstream credential store
    pub store: CredentialStore,
    /// Path of the OAuth callback route
    pub redirect_path: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl AppState {
    /// Build every component from validated configuration.
    ///
    /// Operations are registered and the registry frozen before the bridge
    /// computes its effective scope set.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let http_client = build_http_client(config.upstream.timeout)?;
        let redmine = RedmineClient::new(http_client.clone(), &config.upstream.base_url)?;
        let catalog = Arc::new(build_catalog(&redmine)?);

        let backend: Arc<dyn CredentialBackend> = match config.credentials.backend {
            CredentialBackendKind::Memory => Arc::new(InMemoryCredentialBackend::new()),
            CredentialBackendKind::File => Arc::new(match config.credentials.directory_path() {
                Some(dir) => FileCredentialBackend::new(dir)?,
                None => FileCredentialBackend::default_location()?,
            }),
        };
        let store = CredentialStore::with_options(
            backend,
            config.credentials.clock_skew,
            config.credentials.refresh_scope_policy,
        );

        let signing_key = config.session.resolve_signing_key()?;
        let issuer = Arc::new(SessionIssuer::new(
            &signing_key,
            config.session.issuer.clone(),
            config.session.ttl,
        )?);

        let redirect_uri = config.server.redirect_uri(&config.upstream.redirect_path)?;
        let client = Arc::new(UpstreamOAuthClient::new(
            http_client,
            &config.upstream,
            redirect_uri,
        )?);

        let allowlist = config.upstream.scope_allowlist();
        let bridge = Arc::new(AuthorizationBridge::new(
            catalog.registry(),
            allowlist.as_ref(),
            Arc::clone(&client),
            store.clone(),
            Arc::clone(&issuer),
            BridgeOptions {
                pending_ttl: config.exchange.pending_ttl,
                pkce: config.upstream.pkce,
                max_pending: config.exchange.max_pending,
            },
        )?);
        let gate = Arc::new(EnforcementGate::new(catalog, store.clone(), issuer, client)?);

        Ok(Self {
            bridge,
            gate,
            store,
            redirect_path: config.upstream.redirect_path.clone(),
            request_timeout: config.server.request_timeout,
        })
    }
}

/// Register every Redmine operation and freeze the registry.
pub fn build_catalog(client: &RedmineClient) -> Result<OperationCatalog> {
    let mut catalog = OperationCatalog::new();
    register_operations(&mut catalog, client)?;
    catalog.freeze();
    Ok(catalog)
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/oauth/authorize", get(handlers::authorize))
        .route(&state.redirect_path, get(handlers::callback))
        .route("/operations", get(handlers::list_operations))
        .route("/operations/{name}", post(handlers::invoke_operation))
        .route("/session", delete(handlers::revoke_session))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.request_timeout,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the bridge until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let state = Arc::new(AppState::from_config(&config)?);

    let (shutdown_tx, _) = broadcast::channel(1);
    spawn_reaper(
        state.store.clone(),
        config.credentials.reap_interval,
        config.credentials.grace_period,
        shutdown_tx.subscribe(),
    );
    spawn_attempt_sweeper(
        Arc::clone(&state.bridge),
        (config.exchange.pending_ttl / 2).max(Duration::from_secs(1)),
        shutdown_tx.subscribe(),
    );

    let app = create_router(Arc::clone(&state));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("============================================================");
    info!("REDMINE OAUTH BRIDGE v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================================");
    info!(host = %config.server.host, port = config.server.port, "Listening");
    info!(upstream = %config.upstream.base_url, "Upstream");
    info!(
        "Effective scopes: {}",
        format_scope_list(state.bridge.effective_scopes())
    );
    info!(
        "  GET  {}/oauth/authorize  (start authorization)",
        config.server.public_base_url()
    );
    if config.credentials.backend == CredentialBackendKind::Memory {
        warn!("Credentials are held in memory; sessions end on restart");
    }
    info!("============================================================");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Bridge shutdown complete");
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
