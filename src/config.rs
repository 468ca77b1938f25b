//! Application configuration module
//!
//! Settings are layered: built-in defaults, then an optional `projector.toml`,
//! then environment variables (a `.env` file is loaded first if present).

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration sources: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// Canonical store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// Require TLS (set by `sslmode=require` in DATABASE_URL)
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 10,
            require_tls: false,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Where a target family lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Served by the in-process adapter
    Memory,
    /// Served by a remote store
    Remote(Url),
}

impl Endpoint {
    fn parse(raw: Option<String>, schemes: &[&str]) -> Result<Self, ConfigError> {
        match raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            None => Ok(Endpoint::Memory),
            Some(s) if s.eq_ignore_ascii_case("memory") => Ok(Endpoint::Memory),
            Some(s) => {
                let url = Url::parse(&s)
                    .map_err(|e| ConfigError::InvalidValue(format!("Invalid endpoint '{}': {}", s, e)))?;
                if !schemes.contains(&url.scheme()) {
                    return Err(ConfigError::InvalidValue(format!(
                        "Endpoint '{}' must use one of: {}",
                        s,
                        schemes.join(", ")
                    )));
                }
                Ok(Endpoint::Remote(url))
            }
        }
    }
}

/// Graph target (Neo4j HTTP)
#[derive(Debug, Clone)]
pub struct GraphTargetConfig {
    pub endpoint: Endpoint,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Document target (PostgreSQL JSONB)
#[derive(Debug, Clone)]
pub struct DocumentTargetConfig {
    pub endpoint: Endpoint,
    pub collection: String,
}

/// Search target (Elasticsearch)
#[derive(Debug, Clone)]
pub struct SearchTargetConfig {
    pub endpoint: Endpoint,
    pub index: String,
    pub language: String,
}

/// Cache target (Redis)
#[derive(Debug, Clone)]
pub struct CacheTargetConfig {
    pub endpoint: Endpoint,
}

/// All target families plus the bound on a single store interaction
#[derive(Debug, Clone)]
pub struct TargetsConfig {
    pub graph: GraphTargetConfig,
    pub document: DocumentTargetConfig,
    pub search: SearchTargetConfig,
    pub cache: CacheTargetConfig,
    pub timeout: Duration,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            graph: GraphTargetConfig {
                endpoint: Endpoint::Memory,
                user: "neo4j".to_string(),
                password: String::new(),
                database: "neo4j".to_string(),
            },
            document: DocumentTargetConfig {
                endpoint: Endpoint::Memory,
                collection: "groups".to_string(),
            },
            search: SearchTargetConfig {
                endpoint: Endpoint::Memory,
                index: "materials".to_string(),
                language: "russian".to_string(),
            },
            cache: CacheTargetConfig {
                endpoint: Endpoint::Memory,
            },
            timeout: Duration::from_secs(10),
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub targets: TargetsConfig,
}

impl Settings {
    /// Load settings from `projector.toml` (optional) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let raw = config::Config::builder()
            .add_source(config::File::with_name("projector").required(false))
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        Self::from_source(&raw)
    }

    fn from_source(raw: &config::Config) -> Result<Self, ConfigError> {
        let text = |key: &str| raw.get_string(key).ok();

        let server = ServerConfig {
            host: text("host")
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: text("port")
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let max_pool_size = text("db_max_connections")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        // Try DATABASE_URL first, fall back to individual vars
        let database = if let Some(database_url) = text("database_url") {
            Self::parse_database_url(&database_url, max_pool_size)?
        } else {
            let defaults = DatabaseConfig::default();
            DatabaseConfig {
                host: text("db_host").unwrap_or(defaults.host),
                port: text("db_port")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(defaults.port),
                user: text("db_user").unwrap_or(defaults.user),
                password: text("db_password").unwrap_or_default(),
                database: text("db_name").unwrap_or(defaults.database),
                max_pool_size,
                require_tls: false,
            }
        };

        let cors = CorsConfig {
            allowed_origins: text("allowed_origins")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let defaults = TargetsConfig::default();
        let targets = TargetsConfig {
            graph: GraphTargetConfig {
                endpoint: Endpoint::parse(text("graph_url"), &["http", "https"])?,
                user: text("graph_user").unwrap_or(defaults.graph.user),
                password: text("graph_password").unwrap_or_default(),
                database: text("graph_database").unwrap_or(defaults.graph.database),
            },
            document: DocumentTargetConfig {
                endpoint: Endpoint::parse(text("document_url"), &["postgres", "postgresql"])?,
                collection: text("document_collection").unwrap_or(defaults.document.collection),
            },
            search: SearchTargetConfig {
                endpoint: Endpoint::parse(text("search_url"), &["http", "https"])?,
                index: text("search_index").unwrap_or(defaults.search.index),
                language: text("search_language").unwrap_or(defaults.search.language),
            },
            cache: CacheTargetConfig {
                endpoint: Endpoint::parse(text("cache_url"), &["redis"])?,
            },
            timeout: text("target_timeout_secs")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        };

        Ok(Self {
            server,
            database,
            cors,
            targets,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    pub fn parse_database_url(url: &str, max_pool_size: usize) -> Result<DatabaseConfig, ConfigError> {
        let parsed = Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let require_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && v == "require");

        // Userinfo arrives percent-encoded
        let decode = |raw: &str| {
            percent_decode_str(raw)
                .decode_utf8()
                .map(|text| text.into_owned())
                .map_err(|_| ConfigError::InvalidValue("DATABASE_URL credentials are not UTF-8".to_string()))
        };

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: if parsed.username().is_empty() {
                "postgres".to_string()
            } else {
                decode(parsed.username())?
            },
            password: parsed.password().map(decode).transpose()?.unwrap_or_default(),
            database,
            max_pool_size,
            require_tls,
        })
    }
}
