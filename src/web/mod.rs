pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(routes::status))
        .route("/api/login", post(routes::login))
        .route("/api/bridge", post(routes::pair_bridge))
        .route("/api/reset", post(routes::reset))
        .route("/api/debug", get(routes::debug))
        .with_state(state)
}
