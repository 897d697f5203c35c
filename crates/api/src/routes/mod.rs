//! HTTP routes

pub mod admin;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/webhooks", get(admin::list_webhook_events))
        .route(
            "/admin/webhooks/{id}/replay",
            post(admin::replay_webhook_event),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_admin_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(webhooks::receive_payment_webhook))
        .merge(admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
