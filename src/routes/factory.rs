//! App factory route handler
//!
//! Generates a governed app spec from an intent. Unlike the chat path this
//! never retries; ungovernable parts of the spec are removed and reported.

use crate::audit::RequestSource;
use crate::error::{validation_error, ApiResult};
use crate::pipeline::types::FactoryOutcome;
use crate::pipeline::QueryRequest;
use crate::state::SharedState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FactoryBuildRequest {
    #[validate(length(min = 1, max = 2000, message = "intent must be 1-2000 characters"))]
    pub intent: String,

    #[validate(length(min = 1, max = 64, message = "role must be 1-64 characters"))]
    pub role: String,

    pub session_id: Option<Uuid>,
}

/// Build a governed app spec from an intent
pub async fn build_app_spec(
    State(state): State<SharedState>,
    Json(payload): Json<FactoryBuildRequest>,
) -> ApiResult<Json<FactoryOutcome>> {
    // Validate input
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let request = QueryRequest {
        session_id: payload.session_id.unwrap_or_else(Uuid::new_v4),
        intent: payload.intent,
        role: payload.role,
        source: RequestSource::Factory,
    };

    let outcome = state.orchestrator.run_factory(request).await;
    Ok(Json(outcome))
}
