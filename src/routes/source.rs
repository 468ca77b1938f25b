//! Canonical store routes
//!
//! Seeding and resetting destroy canonical data, so both go through the
//! confirmation gate with the caller's `confirm` flag.

use crate::error::ApiResult;
use crate::lifecycle::{ConfirmationGate, ConfirmationPrompt, Decision};
use crate::models::{
    MessageResponse, ResetRequest, ResetResponse, SeedRequest, SeedResponse, SuccessResponse,
    VerifyResponse, DEFAULT_SEED,
};
use crate::source::CanonicalDataset;
use crate::state::SharedState;
use axum::{extract::State, response::IntoResponse, response::Response, Json};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

/// Introspect the canonical store and compare it with the registry
pub async fn verify_source(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<VerifyResponse>>> {
    let verification = state.extractor().verify().await?;
    let message = if verification.matches {
        "Canonical store matches the registry".to_string()
    } else {
        format!("{} mismatches found", verification.mismatches.len())
    };

    Ok(Json(SuccessResponse::with_data(
        message,
        VerifyResponse { verification },
    )))
}

/// Recreate the canonical tables and load the reference dataset
pub async fn seed_source(
    State(state): State<SharedState>,
    Json(payload): Json<SeedRequest>,
) -> ApiResult<Response> {
    let prompt = ConfirmationPrompt::source("recreate the canonical tables and load the reference dataset");
    if !Decision(payload.confirm).confirm(&prompt) {
        return Ok(Json(MessageResponse::declined(format!("Declined: {}", prompt.action))).into_response());
    }

    let seed = payload.seed.unwrap_or(DEFAULT_SEED);
    let dataset = CanonicalDataset::reference(&mut StdRng::seed_from_u64(seed));
    let rows = state
        .extractor()
        .store()
        .provision(&state.registry, &dataset)
        .await?;

    info!(seed, rows, "Seeded canonical store");

    let response = SeedResponse {
        seed,
        rows,
        counts: dataset.counts(),
    };
    Ok(Json(SuccessResponse::with_data(format!("Loaded {} canonical rows", rows), response)).into_response())
}

/// Drop every canonical table in teardown order
pub async fn reset_source(
    State(state): State<SharedState>,
    Json(payload): Json<ResetRequest>,
) -> ApiResult<Response> {
    let prompt = ConfirmationPrompt::source("drop every canonical table");
    if !Decision(payload.confirm).confirm(&prompt) {
        return Ok(Json(MessageResponse::declined(format!("Declined: {}", prompt.action))).into_response());
    }

    let tables_dropped = state.extractor().store().reset(&state.registry).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Dropped {} canonical tables", tables_dropped),
        ResetResponse { tables_dropped },
    ))
    .into_response())
}
