//! Canonical schema route

use crate::models::SchemaResponse;
use crate::state::SharedState;
use axum::{extract::State, Json};

/// Registry declarations with both traversal orders
pub async fn describe_schema(State(state): State<SharedState>) -> Json<SchemaResponse> {
    let registry = &state.registry;
    Json(SchemaResponse {
        creation_order: registry.creation_order().to_vec(),
        teardown_order: registry.teardown_order(),
        entities: registry.entities().to_vec(),
        relations: registry.relations().to_vec(),
    })
}
