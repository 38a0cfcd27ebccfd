use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use validator::Validate;

use super::ApiError;
use crate::extractors::{AppJson, AuthenticatedUser};
use crate::models::mastery::{
    ModuleMasteryResponse, SubmitPracticeTestRequest, SubmitPracticeTestResponse,
};
use crate::services::AppState;

/// Graded practice-test answers for the caller; runs the waterfall update
/// for each result in order.
pub async fn submit_practice_test(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
    user: AuthenticatedUser,
    AppJson(req): AppJson<SubmitPracticeTestRequest>,
) -> Result<Json<SubmitPracticeTestResponse>, ApiError> {
    req.validate()
        .map_err(|e| ApiError::BadRequest(format!("Invalid submission: {}", e)))?;

    tracing::info!(
        "Practice test submission: user={} module={} results={}",
        user.user_id,
        module_id,
        req.results.len()
    );

    let updated = state
        .mastery
        .submit_evaluations(&module_id, &user.user_id, &req.results)
        .await?;

    Ok(Json(SubmitPracticeTestResponse { updated }))
}

pub async fn get_module_mastery(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
    user: AuthenticatedUser,
) -> Result<Json<ModuleMasteryResponse>, ApiError> {
    let records = state
        .mastery
        .records_for_module(&module_id, &user.user_id)
        .await?;

    Ok(Json(ModuleMasteryResponse {
        module_id,
        student_id: user.user_id,
        records,
    }))
}
