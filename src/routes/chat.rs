//! Chat query route handler
//!
//! Entry point for the SQL pipeline: natural-language intent in, governed
//! query result out. The handler never surfaces a pipeline fault as an HTTP
//! error; failed pipelines come back as a `failed` outcome with suggestions.

use crate::audit::RequestSource;
use crate::error::{validation_error, ApiResult};
use crate::pipeline::types::QueryOutcome;
use crate::pipeline::QueryRequest;
use crate::state::SharedState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueryRequest {
    #[validate(length(min = 1, max = 2000, message = "intent must be 1-2000 characters"))]
    pub intent: String,

    #[validate(length(min = 1, max = 64, message = "role must be 1-64 characters"))]
    pub role: String,

    /// Caller-supplied session correlation id; generated when absent.
    pub session_id: Option<Uuid>,
}

/// Run one intent through the self-healing pipeline
pub async fn run_query(
    State(state): State<SharedState>,
    Json(payload): Json<ChatQueryRequest>,
) -> ApiResult<Json<QueryOutcome>> {
    // Validate input
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let request = QueryRequest {
        session_id: payload.session_id.unwrap_or_else(Uuid::new_v4),
        intent: payload.intent,
        role: payload.role,
        source: RequestSource::Chat,
    };

    let outcome = state.orchestrator.run_query(request).await;
    Ok(Json(outcome))
}
