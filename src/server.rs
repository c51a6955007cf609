//! HTTP server bootstrap for the AS2 gateway.
//!
//! This module wires together:
//! - configuration
//! - the SQLite store and audit log
//! - core services (transmission engine, inbound receiver, partner registry)
//! - the background retry worker
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::api::handlers::{health, ready, ACTOR_HEADER};
use crate::as2::{
    AsyncMdnConfig, AsyncMdnDispatcher, InboundReceiver, ReceiverConfig, ReqwestTransport,
    RoutingTable,
};
use crate::crypto::EnvKeyStore;
use crate::engine::{
    EngineConfig, PartnerRegistry, RetryWorker, RetryWorkerConfig, TransmissionEngine,
    WorkerMessage,
};
use crate::infra::{
    AcceptAllValidator, AuditSink, LoggingRouter, RetryingAuditSink, SqliteAuditLog, SqliteStore,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Largest accepted request body (AS2 envelopes can be large).
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://as2-gateway.db?mode=rwc".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid listen address {host}:{port}"))?;

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let max_body_bytes: usize = std::env::var("AS2_MAX_BODY_BYTES")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(50 * 1024 * 1024);

        Ok(Self {
            database_url,
            listen_addr,
            max_connections,
            max_body_bytes,
        })
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub engine: Arc<TransmissionEngine>,
    pub receiver: Arc<InboundReceiver>,
    pub registry: Arc<PartnerRegistry>,
    pub audit_log: Arc<SqliteAuditLog>,
    /// Control channel of the retry worker, when one is running
    pub worker: Option<mpsc::Sender<WorkerMessage>>,
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting AS2 gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    let engine_config = EngineConfig::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Max connections: {}", config.max_connections);
    info!("  AS2 id: {}", engine_config.own_as2_id);
    match &engine_config.async_mdn_url {
        Some(url) => info!("  Async MDN callback: {}", url),
        None => info!("  Async MDN callback not configured (set AS2_MDN_URL for async partners)"),
    }

    // Connect to SQLite
    info!("Opening database...");
    let store = SqliteStore::connect(&config.database_url, config.max_connections).await?;
    info!("Database opened");

    if migrate_on_startup() {
        info!("Running database migrations...");
        store.migrate().await?;
        info!("Database migrations applied");
    } else {
        info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
    }

    // Collaborators
    let keys = Arc::new(EnvKeyStore::from_env().context("Loading AS2 private keys")?);
    let transport = Arc::new(ReqwestTransport::new()?);
    let audit_log = Arc::new(SqliteAuditLog::new(store.pool().clone()));
    let audit_sink = Arc::new(RetryingAuditSink::new(audit_log.clone()));
    let audit: Arc<dyn AuditSink> = audit_sink.clone();
    let routes = RoutingTable::from_env()?;
    info!("  Routing rules: {}", routes.rules.len());

    // Initialize services
    let engine = Arc::new(TransmissionEngine::new(
        store.clone(),
        Arc::new(store.clone()),
        keys.clone(),
        transport.clone(),
        audit.clone(),
        engine_config.clone(),
    ));
    let receiver = Arc::new(InboundReceiver::new(
        store.clone(),
        Arc::new(store.clone()),
        keys,
        Arc::new(AcceptAllValidator),
        Arc::new(LoggingRouter),
        audit.clone(),
        routes,
        ReceiverConfig {
            own_as2_id: engine_config.own_as2_id.clone(),
            message_id_host: engine_config.message_id_host.clone(),
            policy: engine_config.policy.clone(),
        },
    ));
    let registry = Arc::new(
        PartnerRegistry::new(store.clone(), audit.clone())
            .with_expiring_window(engine_config.expiring_window),
    );

    let mut mdn_config = AsyncMdnConfig::new(engine_config.own_as2_id.clone());
    mdn_config.message_id_host = engine_config.message_id_host.clone();
    let dispatcher = Arc::new(AsyncMdnDispatcher::new(
        store.clone(),
        transport,
        audit,
        mdn_config,
    ));

    // Background worker
    let worker = RetryWorker::new(RetryWorkerConfig::from_env(), engine.clone())
        .with_async_mdns(dispatcher)
        .with_audit_backlog(audit_sink.clone());
    let worker_handle = worker.control_handle();
    let worker_task = tokio::spawn(worker.run());

    // Create application state
    let state = AppState {
        store,
        engine,
        receiver,
        registry,
        audit_log,
        worker: Some(worker_handle.clone()),
    };

    // Build router
    let app = build_router(state, config.max_body_bytes, cors_layer_from_env()?);

    // Start server
    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("AS2 gateway is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping retry worker");
    let _ = worker_handle.send(WorkerMessage::Shutdown).await;
    let _ = worker_task.await;
    if let Err(e) = audit_sink.flush_pending().await {
        warn!(
            error = %e,
            pending = audit_sink.pending().await,
            "Audit records not written before shutdown"
        );
    }

    Ok(())
}

/// Initialize the tracing subscriber; `LOG_JSON=1` switches to JSON lines.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let json = std::env::var("LOG_JSON")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn migrate_on_startup() -> bool {
    std::env::var("DB_MIGRATE_ON_STARTUP")
        .ok()
        .map(|v| {
            !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off"
            )
        })
        .unwrap_or(true)
}

/// Assemble the full router with state applied.
pub fn build_router(state: AppState, max_body_bytes: usize, cors: Option<CorsLayer>) -> Router {
    let mut router = Router::new()
        .nest("/as2", crate::api::as2_router())
        .nest("/api", crate::api::router())
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors {
        router = router.layer(cors_layer);
    }

    router.with_state(state)
}

/// CORS for the admin dashboard, from `CORS_ALLOW_ORIGINS` (`*` or a comma list).
pub fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                HeaderName::from_static(ACTOR_HEADER),
            ]),
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
