use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;

use crate::app::App;
use crate::models::HealthResponse;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(app): State<Arc<App>>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: format!(
            "Ready ({} environment, {} resident rooms)",
            app.config.environment,
            app.registry.resident_count()
        ),
    })
}
