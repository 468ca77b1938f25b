//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod projection;
mod readback;
mod schema;
mod source;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))
        .route("/api/schema", get(schema::describe_schema))

        // Canonical store
        .route("/api/source/verify", post(source::verify_source))
        .route("/api/source/seed", post(source::seed_source))
        .route("/api/source/reset", post(source::reset_source))

        // Lifecycle
        .route("/api/targets", get(projection::list_targets))
        .route("/api/projections/build", post(projection::build))
        .route("/api/projections/teardown", post(projection::teardown))
        .route("/api/projections/cancel", post(projection::cancel))
        .route("/api/projections/report", get(projection::last_report))

        // Read-back
        .route("/api/graph/attendance", get(readback::attendance))
        .route("/api/documents/groups", get(readback::list_groups))
        .route("/api/search/materials", get(readback::search_materials))
        .route("/api/cache/groups/{id}/students", get(readback::group_students))
        .route("/api/cache/lectures/{id}/visitors", get(readback::lecture_visitors))
        .route("/api/cache/students/{id}", get(readback::student))
        .route("/api/cache/students/{id}/visits", get(readback::student_visits))

        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Projector is running.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
