//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::db;
use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Highest server sequence, absent when the database is unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_seq: Option<u64>,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let latest_seq = match db::latest_seq(&state.pool).await {
        Ok(seq) => Some(seq),
        Err(e) => {
            tracing::warn!("Health check could not reach the database: {}", e);
            None
        }
    };

    Json(HealthResponse {
        status: if latest_seq.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        latest_seq,
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Tandem Sync Server"
}
