use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::extractors::AuthenticatedUser;
use crate::handlers::ApiError;
use crate::models::rate_limit::FEATURE_PRACTICE_TEST;
use crate::services::AppState;

/// Consumes one unit of `feature` quota for the caller before running the handler
async fn enforce_feature_quota(
    state: &AppState,
    feature: &str,
    request: Request,
    next: Next,
) -> Response {
    let Some(user) = AuthenticatedUser::from_headers(request.headers()) else {
        return ApiError::Unauthorized.into_response();
    };

    match state.rate_limiter.enforce(&user.user_id, feature).await {
        Ok(remaining) => {
            tracing::debug!(
                "Admitted user={} feature={} remaining={}",
                user.user_id,
                feature,
                remaining
            );
            next.run(request).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Practice-test grading calls the LLM; gate it by the practiceTest quota
pub async fn practice_test_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    enforce_feature_quota(&state, FEATURE_PRACTICE_TEST, request, next).await
}
