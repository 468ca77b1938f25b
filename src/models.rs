//! Data models and DTOs (Data Transfer Objects)
//!
//! Request and response structures used by the API.

use crate::lifecycle::{RunReport, TargetStatus};
use crate::projection::{Granularity, VisitEntry};
use crate::schema::{EntityDef, EntityKind, Relation};
use crate::source::SourceVerification;
use crate::targets::{SearchHit, TargetKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

/// Seed of the reference dataset when a request names none
pub const DEFAULT_SEED: u64 = 42;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl SuccessResponse<RunReport> {
    /// Run reports carry their own verdict
    pub fn report(report: RunReport) -> Self {
        Self {
            success: report.succeeded(),
            message: report.summary(),
            data: Some(report),
        }
    }
}

/// Message-only response (no data)
#[derive(Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Build selected targets; an empty list means all of them
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    #[serde(default)]
    #[validate(length(max = 4, message = "At most four targets can be selected"))]
    pub targets: Vec<TargetKind>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRequest {
    #[serde(default)]
    #[validate(length(max = 4, message = "At most four targets can be selected"))]
    pub targets: Vec<TargetKind>,
    pub granularity: Granularity,
    /// Nothing is removed unless this is true
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRequest {
    #[serde(default)]
    pub confirm: bool,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SearchQuery {
    #[validate(length(min = 1, max = 200, message = "Query must be 1-200 characters"))]
    pub q: String,
    #[validate(range(min = 1, max = 100, message = "Size must be between 1 and 100"))]
    pub size: Option<usize>,
}

impl SearchQuery {
    pub fn size(&self) -> usize {
        self.size.unwrap_or(10)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_visit_range"))]
pub struct VisitRangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl VisitRangeQuery {
    /// Open ends default to the widest possible window
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.from.unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.to.unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }
}

fn validate_visit_range(query: &VisitRangeQuery) -> Result<(), ValidationError> {
    match (query.from, query.to) {
        (Some(from), Some(to)) if from > to => {
            let mut error = ValidationError::new("range");
            error.message = Some("'from' must not be after 'to'".into());
            Err(error)
        }
        _ => Ok(()),
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub creation_order: Vec<EntityKind>,
    pub teardown_order: Vec<EntityKind>,
    pub entities: Vec<EntityDef>,
    pub relations: Vec<Relation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub verification: SourceVerification,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedResponse {
    pub seed: u64,
    pub rows: usize,
    pub counts: BTreeMap<EntityKind, usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub tables_dropped: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsResponse {
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub cancelled_runs: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub index: String,
    pub query: String,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitsResponse {
    pub student_id: i64,
    pub visits: Vec<VisitEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupsResponse {
    pub collection: String,
    pub groups: Vec<Value>,
}

/// Members of one cached set, e.g. a group's students or a lecture's visitors
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersResponse {
    pub id: i64,
    pub members: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceResponse {
    /// `(student id, lecture id)` pairs
    pub attended: Vec<(i64, i64)>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResponse {
    pub student: Value,
    pub groups: Vec<Value>,
}
