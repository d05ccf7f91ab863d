// routes.rs
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        activation::initiate_activation, status::activation_status, webhook::payment_webhook,
    },
    AppState,
};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running"
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let activation_routes = Router::new()
        .route("/", post(initiate_activation))
        .route("/status", get(activation_status));

    // Webhook route registered for POST only; axum answers 405 for anything
    // else, which is what the gateway transport expects.
    let payment_routes = Router::new().route("/webhook", post(payment_webhook));

    let api_route = Router::new()
        .nest("/activation", activation_routes)
        .nest("/payment", payment_routes)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
}
