//! Database connection management
//!
//! Builds PostgreSQL pools for the canonical store and for the JSONB document
//! target. Every pool has bounded wait/create timeouts so no store interaction
//! blocks indefinitely.

use crate::config::DatabaseConfig;
use crate::error::{ProjectionError, ProjectionResult};
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use std::time::Duration;
use tracing::{debug, info};

/// Create a connection pool, with TLS when the config requires it
pub fn create_pool(config: &DatabaseConfig, timeout: Duration) -> ProjectionResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.connect_timeout = Some(timeout);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig {
        max_size: config.max_pool_size,
        timeouts: Timeouts {
            wait: Some(timeout),
            create: Some(timeout),
            recycle: Some(timeout),
        },
        ..PoolConfig::default()
    });

    let pool = if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
    }
    .map_err(|e| ProjectionError::Config(format!("Failed to create pool: {}", e)))?;

    debug!(
        host = %config.host,
        database = %config.database,
        tls = config.require_tls,
        "Connection pool configured"
    );
    Ok(pool)
}

/// Round-trip a trivial query; any failure means the store is unreachable
pub async fn ping(pool: &Pool) -> Result<(), String> {
    let client = pool.get().await.map_err(|e| e.to_string())?;
    client
        .query_one("SELECT 1", &[])
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Read `server_version_num` (e.g. 150004)
pub async fn server_version_num(pool: &Pool) -> Result<i32, String> {
    let client = pool.get().await.map_err(|e| e.to_string())?;
    let row = client
        .query_one("SELECT current_setting('server_version_num')::int", &[])
        .await
        .map_err(|e| e.to_string())?;
    let version: i32 = row.get(0);
    info!(version, "PostgreSQL server version");
    Ok(version)
}
