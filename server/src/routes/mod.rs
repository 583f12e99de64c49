//! HTTP route definitions.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Prefix of the sync protocol endpoints.
pub const SYNC_PREFIX: &str = "/api/sync";

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .nest(SYNC_PREFIX, sync::routes())
}
