//! API routes

pub mod admin_billing;


use axum::{middleware, routing::get, routing::post, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{auth::require_admin, state::AppState};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/pipeline/run", post(admin_billing::run_pipeline))
        .route("/steps/{step}/run", post(admin_billing::run_step))
        .route("/late-payments", post(admin_billing::record_late_payment))
        .route("/invariants", get(admin_billing::run_invariants))
        .route("/invariants/{name}", get(admin_billing::run_invariant))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .nest("/admin/billing", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
