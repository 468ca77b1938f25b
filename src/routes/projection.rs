//! Lifecycle routes: target status, build, teardown and cancellation

use crate::error::{validation_error, ApiResult, AppError};
use crate::lifecycle::{CancelToken, Decision, RunReport};
use crate::models::{BuildRequest, CancelResponse, SuccessResponse, TargetsResponse, TeardownRequest};
use crate::state::SharedState;
use axum::{extract::State, Json};
use tracing::info;
use validator::Validate;

/// Current state and inventory of every target
pub async fn list_targets(
    State(state): State<SharedState>,
) -> Json<SuccessResponse<TargetsResponse>> {
    let targets = state.orchestrator.status().await;
    Json(SuccessResponse::with_data(
        format!("{} targets", targets.len()),
        TargetsResponse { targets },
    ))
}

/// Build the selected targets from the canonical store
pub async fn build(
    State(state): State<SharedState>,
    Json(payload): Json<BuildRequest>,
) -> ApiResult<Json<SuccessResponse<RunReport>>> {
    payload
        .validate()
        .map_err(|e| validation_error(e.to_string()))?;

    let report = state.orchestrator.build(&payload.targets, CancelToken::new()).await;
    Ok(Json(SuccessResponse::report(report)))
}

/// Remove projected state; declined unless `confirm` is set
pub async fn teardown(
    State(state): State<SharedState>,
    Json(payload): Json<TeardownRequest>,
) -> ApiResult<Json<SuccessResponse<RunReport>>> {
    payload
        .validate()
        .map_err(|e| validation_error(e.to_string()))?;

    let report = state
        .orchestrator
        .teardown(
            &payload.targets,
            payload.granularity,
            &Decision(payload.confirm),
            CancelToken::new(),
        )
        .await;
    Ok(Json(SuccessResponse::report(report)))
}

/// Ask every running build or teardown to stop at its next stage
pub async fn cancel(State(state): State<SharedState>) -> Json<SuccessResponse<CancelResponse>> {
    let cancelled_runs = state.orchestrator.cancel_running().await;
    info!(runs = cancelled_runs, "Cancellation requested");
    Json(SuccessResponse::with_data(
        format!("Cancelled {} running operations", cancelled_runs),
        CancelResponse { cancelled_runs },
    ))
}

pub async fn last_report(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<RunReport>>> {
    let report = state
        .orchestrator
        .last_report()
        .await
        .ok_or_else(|| AppError::NotFound("No build or teardown has run yet".to_string()))?;
    Ok(Json(SuccessResponse::report(report)))
}
