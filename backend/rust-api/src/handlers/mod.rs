use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::metrics;
use crate::models::rate_limit::QuotaExceededResponse;
use crate::services::{
    mastery::MasteryError, mastery_service::MasteryServiceError, mastery_store::StoreError,
    rate_limiter::RateLimitError, AppState,
};

pub mod features;
pub mod mastery;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    QuotaExceeded {
        feature: String,
        retry_after_seconds: u64,
    },
    ServiceUnavailable(String),
    Internal(String),
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::QuotaExceeded {
                feature,
                retry_after_seconds,
            } => ApiError::QuotaExceeded {
                feature,
                retry_after_seconds,
            },
            RateLimitError::UnknownFeature(feature) => {
                ApiError::NotFound(format!("Unknown feature: {}", feature))
            }
            RateLimitError::StoreUnavailable(_) => ApiError::ServiceUnavailable(
                "Usage limits are temporarily unavailable, please try again shortly".to_string(),
            ),
        }
    }
}

impl From<MasteryServiceError> for ApiError {
    fn from(err: MasteryServiceError) -> Self {
        match err {
            MasteryServiceError::Mastery(MasteryError::Validation(msg)) => ApiError::BadRequest(msg),
            MasteryServiceError::Store(StoreError::ModuleNotFound(module_id)) => {
                ApiError::NotFound(format!("Module {} not found", module_id))
            }
            other => {
                tracing::error!("Mastery update failed: {}", other);
                ApiError::Internal("Failed to update mastery".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::QuotaExceeded {
                feature,
                retry_after_seconds,
            } => return quota_exceeded_response(feature, retry_after_seconds),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Missing authenticated user".to_string(),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (
            status,
            Json(json!({ "message": message, "status": status.as_u16() })),
        )
            .into_response()
    }
}

fn quota_exceeded_response(feature: String, retry_after_seconds: u64) -> Response {
    let body = QuotaExceededResponse {
        message: format!(
            "Usage limit reached for {}. Try again in {} seconds.",
            feature, retry_after_seconds
        ),
        feature,
        retry_after_seconds,
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = serde_json::Map::new();
    let mut all_healthy = true;

    let mastery_store = state.mastery.store();
    let mastery_health = match tokio::time::timeout(
        std::time::Duration::from_secs(1),
        mastery_store.ping(),
    )
    .await
    {
        Ok(Ok(())) => json!({ "status": "healthy", "backend": mastery_store.name() }),
        Ok(Err(e)) => {
            all_healthy = false;
            json!({ "status": "unhealthy", "backend": mastery_store.name(), "error": e.to_string() })
        }
        Err(_) => {
            all_healthy = false;
            json!({ "status": "unhealthy", "backend": mastery_store.name(), "error": "timeout after 1s" })
        }
    };
    dependencies.insert("mastery_store".to_string(), mastery_health);

    let counter_store = state.rate_limiter.store();
    let counter_health = match tokio::time::timeout(
        std::time::Duration::from_millis(500),
        counter_store.ping(),
    )
    .await
    {
        Ok(Ok(())) => json!({ "status": "healthy", "backend": counter_store.name() }),
        Ok(Err(e)) => {
            all_healthy = false;
            json!({ "status": "unhealthy", "backend": counter_store.name(), "error": e.to_string() })
        }
        Err(_) => {
            all_healthy = false;
            json!({ "status": "unhealthy", "backend": counter_store.name(), "error": "timeout after 500ms" })
        }
    };
    dependencies.insert("counter_store".to_string(), counter_health);

    let (status_code, status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "masterygate-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": dependencies
        })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}
