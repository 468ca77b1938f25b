//! Error handling module
//!
//! Two layers of errors live here:
//! - [`ProjectionError`]: the projection taxonomy. Every variant knows how far it
//!   propagates (record, target or whole run).
//! - [`AppError`]: the HTTP-facing error returned by handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors raised while extracting, projecting or tearing down derived stores
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProjectionError {
    /// Canonical store cannot be reached or authenticated against
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Canonical store structure differs from the schema registry
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A target store cannot be reached
    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    /// A target store rejected a constraint or index declaration
    #[error("Constraint unsupported: {0}")]
    ConstraintUnsupported(String),

    /// A child row references a parent missing from the target store
    #[error("Referential gap: {0}")]
    ReferentialGap(String),

    /// A single record write failed
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Fatal configuration error (cyclic registry, bad join path, bad endpoint)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller abandoned the remaining stages
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A target is already mid-transition
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl ProjectionError {
    /// Errors that stop the whole run before any projector proceeds
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_) | Self::Config(_))
    }

    /// Errors that end one target's pipeline as `Failed`
    pub fn is_fatal_to_target(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch(_)
                | Self::TargetUnavailable(_)
                | Self::ReferentialGap(_)
                | Self::Cancelled(_)
                | Self::Conflict(_)
        )
    }

    /// Errors absorbed at record level: skip, count, continue
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::WriteRejected(_))
    }

    /// Errors that degrade to a warning
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::ConstraintUnsupported(_))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            Self::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            Self::TargetUnavailable(_) => "TARGET_UNAVAILABLE",
            Self::ConstraintUnsupported(_) => "CONSTRAINT_UNSUPPORTED",
            Self::ReferentialGap(_) => "REFERENTIAL_GAP",
            Self::WriteRejected(_) => "WRITE_REJECTED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::Conflict(_) => "CONFLICT",
        }
    }
}

/// Result alias for projection code
pub type ProjectionResult<T> = Result<T, ProjectionError>;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Database connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Projection(e) => {
                let status = match e {
                    ProjectionError::SourceUnavailable(_)
                    | ProjectionError::TargetUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ProjectionError::SchemaMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    ProjectionError::Conflict(_) | ProjectionError::Cancelled(_) => {
                        StatusCode::CONFLICT
                    }
                    ProjectionError::WriteRejected(_)
                    | ProjectionError::ReferentialGap(_)
                    | ProjectionError::ConstraintUnsupported(_) => StatusCode::BAD_GATEWAY,
                    ProjectionError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!("Projection error: {}", e);
                }
                (status, e.code(), e.to_string(), None)
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}
