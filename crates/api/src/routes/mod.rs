pub mod builds;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /builds                 list/search, enqueue
/// /builds/{id}            get
/// /builds/{id}/cancel     cancel (POST)
/// /builds/{id}/logs       stored log (text/plain)
/// /builds/{id}/patch      patch body (text/plain)
/// /builds/{id}/ws         live build events (WebSocket)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/builds", builds::router())
}
