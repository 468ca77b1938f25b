//! Read-back routes over the projected stores

use crate::error::{validation_error, ApiResult, AppError};
use crate::models::{
    AttendanceResponse, GroupsResponse, MembersResponse, SearchQuery, SearchResponse,
    StudentResponse, SuccessResponse, VisitRangeQuery, VisitsResponse,
};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use validator::Validate;

/// Weighted full-text search over lecture materials
pub async fn search_materials(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<SuccessResponse<SearchResponse>>> {
    query
        .validate()
        .map_err(|e| validation_error(e.to_string()))?;

    let hits = state.search.search(&query.q, query.size()).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} materials found", hits.len()),
        SearchResponse {
            index: state.search.index().to_string(),
            query: query.q,
            hits,
        },
    )))
}

/// Cached student value together with its group documents
pub async fn student(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SuccessResponse<StudentResponse>>> {
    let student = state
        .cache
        .student(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Student {} is not in the cache", id)))?;
    let groups = state.documents.groups_of_student(id).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Student {}", id),
        StudentResponse { student, groups },
    )))
}

/// Visits of one student inside a time window, oldest first
pub async fn student_visits(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(range): Query<VisitRangeQuery>,
) -> ApiResult<Json<SuccessResponse<VisitsResponse>>> {
    range
        .validate()
        .map_err(|e| validation_error(e.to_string()))?;

    let (from, to) = range.bounds();
    let visits = state.cache.visits_between(id, from, to).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} visits", visits.len()),
        VisitsResponse { student_id: id, visits },
    )))
}

/// Every group document with its embedded students
pub async fn list_groups(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<GroupsResponse>>> {
    let groups = state.documents.documents().await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} groups", groups.len()),
        GroupsResponse {
            collection: state.documents.collection().to_string(),
            groups,
        },
    )))
}

/// Student ids cached for one group
pub async fn group_students(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SuccessResponse<MembersResponse>>> {
    let members = state.cache.group_members(id).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} students in group {}", members.len(), id),
        MembersResponse { id, members },
    )))
}

/// Student ids cached as visitors of one lecture
pub async fn lecture_visitors(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SuccessResponse<MembersResponse>>> {
    let members = state.cache.lecture_visitors(id).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} visitors of lecture {}", members.len(), id),
        MembersResponse { id, members },
    )))
}

/// Student and lecture pairs linked in the graph
pub async fn attendance(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<AttendanceResponse>>> {
    let attended = state.graph.attended_pairs().await?;
    Ok(Json(SuccessResponse::with_data(
        format!("{} attendance links", attended.len()),
        AttendanceResponse { attended },
    )))
}
