//! Campus Projector
//!
//! Projects a normalised university dataset held in PostgreSQL into four
//! derived stores: a property graph, a document collection, a full-text
//! index and a key-value cache. Every projection can be rebuilt from the
//! canonical rows at any time and torn down in part or in full.

mod config;
mod db;
mod error;
mod introspection;
mod lifecycle;
mod models;
mod projection;
mod routes;
mod schema;
mod source;
mod state;
mod targets;

use crate::config::{Endpoint, Settings, TargetsConfig};
use crate::routes::create_router;
use crate::schema::university_registry;
use crate::source::{PostgresSource, SourceStore};
use crate::state::{AppState, TargetStores};
use crate::targets::{
    CacheStore, DocumentStore, ElasticSearch, GraphStore, MemoryCache, MemoryDocuments, MemoryGraph,
    MemorySearch, Neo4jGraph, PgDocuments, RedisCache, SearchStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting campus projector...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    let registry = Arc::new(university_registry()?);
    info!(order = ?registry.creation_order(), "Schema registry ready");

    let pool = db::create_pool(&settings.database, settings.targets.timeout)?;
    match db::ping(&pool).await {
        Ok(()) => info!(
            host = %settings.database.host,
            database = %settings.database.database,
            "Canonical store reachable"
        ),
        // Builds report SourceUnavailable until the store comes up
        Err(e) => warn!("Canonical store not reachable yet: {}", e),
    }
    let source: Arc<dyn SourceStore> = Arc::new(PostgresSource::new(pool));

    let stores = connect_targets(&settings)?;
    let state = Arc::new(AppState::new(registry, source, stores, &settings.targets));

    let app = create_router(state, &settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("API Endpoints:");
    info!("   GET  /health                          - Liveness");
    info!("   GET  /api/schema                      - Registry and traversal orders");
    info!("   POST /api/source/verify               - Compare canonical store with registry");
    info!("   POST /api/source/seed                 - Load reference dataset (confirm)");
    info!("   POST /api/source/reset                - Drop canonical tables (confirm)");
    info!("   GET  /api/targets                     - Target states and inventories");
    info!("   POST /api/projections/build           - Build targets");
    info!("   POST /api/projections/teardown        - Tear targets down (confirm)");
    info!("   POST /api/projections/cancel          - Cancel running operations");
    info!("   GET  /api/projections/report          - Last run report");
    info!("   GET  /api/graph/attendance            - Student and lecture links");
    info!("   GET  /api/documents/groups            - Group documents");
    info!("   GET  /api/search/materials            - Full-text search");
    info!("   GET  /api/cache/groups/{{id}}/students   - Cached group members");
    info!("   GET  /api/cache/lectures/{{id}}/visitors - Cached lecture visitors");
    info!("   GET  /api/cache/students/{{id}}         - Cached student");
    info!("   GET  /api/cache/students/{{id}}/visits  - Visits in a time window");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,campus_projector=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Pick an adapter per target family from its configured endpoint
fn connect_targets(settings: &Settings) -> anyhow::Result<TargetStores> {
    let targets: &TargetsConfig = &settings.targets;

    let graph: Arc<dyn GraphStore> = match &targets.graph.endpoint {
        Endpoint::Memory => Arc::new(MemoryGraph::new()),
        Endpoint::Remote(url) => Arc::new(Neo4jGraph::new(
            url.clone(),
            targets.graph.user.clone(),
            targets.graph.password.clone(),
            targets.graph.database.clone(),
            targets.timeout,
        )?),
    };

    let documents: Arc<dyn DocumentStore> = match &targets.document.endpoint {
        Endpoint::Memory => Arc::new(MemoryDocuments::new()),
        Endpoint::Remote(url) => {
            let config =
                Settings::parse_database_url(url.as_str(), settings.database.max_pool_size)?;
            Arc::new(PgDocuments::new(db::create_pool(&config, targets.timeout)?))
        }
    };

    let search: Arc<dyn SearchStore> = match &targets.search.endpoint {
        Endpoint::Memory => Arc::new(MemorySearch::new()),
        Endpoint::Remote(url) => Arc::new(ElasticSearch::new(url.clone(), targets.timeout)?),
    };

    let cache: Arc<dyn CacheStore> = match &targets.cache.endpoint {
        Endpoint::Memory => Arc::new(MemoryCache::new()),
        Endpoint::Remote(url) => Arc::new(RedisCache::new(url.clone(), targets.timeout)),
    };

    info!(
        graph = %graph.describe(),
        document = %documents.describe(),
        search = %search.describe(),
        cache = %cache.describe(),
        "Target stores selected"
    );

    Ok(TargetStores {
        graph,
        documents,
        search,
        cache,
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
