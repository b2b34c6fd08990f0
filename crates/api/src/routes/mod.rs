//! HTTP routes

pub mod accounts;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

/// Build the application router. Account routes are mounted under
/// `/<accounts_path>`.
pub fn create_router(state: AppState) -> Router {
    let accounts_path = format!("/{}", state.config.accounts_path);

    Router::new()
        .route("/health", get(health))
        .nest(&accounts_path, accounts::router(state.clone()))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
