use axum::{routing::get, Router};
use std::sync::Arc;

use crate::app::App;
use crate::handlers::{health_check, ready_check};
use crate::ws::handler::ws_handler;

/// Create all routes: the collaboration WebSocket plus the health surface
pub fn create_routes(app: Arc<App>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/ready", get(ready_check))
        .with_state(app)
}
