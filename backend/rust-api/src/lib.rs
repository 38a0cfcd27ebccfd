use axum::{
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(extractors::USER_ID_HEADER),
        ])
        .expose_headers([header::RETRY_AFTER])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api/v1", api_routes(app_state.clone()).layer(cors))
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(
                    middlewares::trace::trace_context_middleware,
                ))
                .layer(middleware::from_fn(
                    middlewares::metrics::metrics_middleware,
                )),
        )
}

fn api_routes(app_state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Grading a practice test calls the LLM, so submissions spend practiceTest quota
    let practice_test_route = Router::new()
        .route(
            "/modules/{module_id}/practice-test/submissions",
            post(handlers::mastery::submit_practice_test),
        )
        .route_layer(middleware::from_fn_with_state(
            app_state,
            middlewares::rate_limit::practice_test_rate_limit_middleware,
        ));

    Router::new()
        .route(
            "/features/{feature}/admission",
            post(handlers::features::request_admission),
        )
        .route(
            "/modules/{module_id}/mastery",
            get(handlers::mastery::get_module_mastery),
        )
        .merge(practice_test_route)
}
