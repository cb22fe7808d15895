//! Policy inspection and hot-reload route handlers

use crate::error::ApiResult;
use crate::policy::RolePolicy;
use crate::state::SharedState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub success: bool,
    pub allowed_tables: Vec<String>,
    pub banned_patterns: Vec<String>,
    pub max_rows_returned: u32,
    pub allowed_chart_types: Vec<String>,
    pub roles: BTreeMap<String, RolePolicy>,
}

/// Current policy snapshot, as every in-flight request sees it
pub async fn current_policy(State(state): State<SharedState>) -> ApiResult<Json<PolicyView>> {
    let snapshot = state.policy.snapshot().await;

    Ok(Json(PolicyView {
        success: true,
        allowed_tables: snapshot.document.allowed_tables.iter().cloned().collect(),
        banned_patterns: snapshot.document.banned_patterns.clone(),
        max_rows_returned: snapshot.document.max_rows_returned,
        allowed_chart_types: snapshot
            .document
            .allowed_chart_types
            .iter()
            .cloned()
            .collect(),
        roles: snapshot.roles.clone(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub success: bool,
    pub message: String,
}

/// Re-read the policy files and atomically swap the snapshot. In-flight
/// requests keep the snapshot they started with.
pub async fn reload_policy(State(state): State<SharedState>) -> ApiResult<Json<ReloadResponse>> {
    state.policy.reload().await?;
    info!("policy snapshot reloaded");

    Ok(Json(ReloadResponse {
        success: true,
        message: "Policy reloaded. New requests use the updated snapshot.".to_string(),
    }))
}
