//! Audit feed route handler

use crate::audit::AuditRecord;
use crate::error::ApiResult;
use crate::state::SharedState;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFeedResponse {
    pub success: bool,
    pub records: Vec<AuditRecord>,
    /// Audit writes lost to sink failures since startup.
    pub dropped_writes: u64,
}

/// Most recent audit records, newest first
pub async fn recent_records(
    State(state): State<SharedState>,
    Query(params): Query<RecentQuery>,
) -> ApiResult<Json<AuditFeedResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let records = state.audit.fetch_recent(limit).await?;

    Ok(Json(AuditFeedResponse {
        success: true,
        records,
        dropped_writes: state.audit.dropped_writes(),
    }))
}
