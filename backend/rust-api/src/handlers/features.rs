use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use super::ApiError;
use crate::extractors::AuthenticatedUser;
use crate::models::rate_limit::AdmissionResponse;
use crate::services::AppState;

/// Admission check for AI features served by other components.
/// A successful call consumes one unit of the caller's quota.
pub async fn request_admission(
    State(state): State<Arc<AppState>>,
    Path(feature): Path<String>,
    user: AuthenticatedUser,
) -> Result<Json<AdmissionResponse>, ApiError> {
    let remaining = state.rate_limiter.enforce(&user.user_id, &feature).await?;

    Ok(Json(AdmissionResponse { feature, remaining }))
}
