#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use masterygate_api::{
    config::Config,
    create_router,
    models::LearningObjective,
    services::{
        counter_store::InMemoryCounterStore, mastery_store::InMemoryMasteryStore, AppState,
    },
};

pub const MODULE_ID: &str = "module-fractions";

pub struct TestApp {
    pub router: Router,
    pub mastery_store: Arc<InMemoryMasteryStore>,
}

pub fn create_test_app() -> TestApp {
    create_test_app_with_config(Config::for_tests())
}

pub fn create_test_app_with_config(config: Config) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let mastery_store = Arc::new(InMemoryMasteryStore::with_objectives(seed_objectives()));
    let app_state = Arc::new(AppState::with_backends(
        config,
        mastery_store.clone(),
        Arc::new(InMemoryCounterStore::new()),
    ));

    TestApp {
        router: create_router(app_state),
        mastery_store,
    }
}

/// Three objectives in course order: obj-a, obj-b, obj-c
fn seed_objectives() -> Vec<LearningObjective> {
    [
        ("obj-a", 1, "Equivalent fractions"),
        ("obj-b", 2, "Adding fractions"),
        ("obj-c", 3, "Multiplying fractions"),
    ]
    .into_iter()
    .map(|(id, order, title)| LearningObjective {
        id: id.to_string(),
        module_id: MODULE_ID.to_string(),
        course_structure_order: order,
        title: title.to_string(),
    })
    .collect()
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user_id: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    app.clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
