//! Route definitions for the `/builds` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::builds;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/builds`.
///
/// ```text
/// GET    /                -> list_builds
/// POST   /                -> create_build
/// GET    /{id}            -> get_build
/// POST   /{id}/cancel     -> cancel_build
/// GET    /{id}/logs       -> build_logs
/// GET    /{id}/patch      -> build_patch
/// GET    /{id}/ws         -> ws::build_ws_handler
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(builds::list_builds).post(builds::create_build))
        .route("/{id}", get(builds::get_build))
        .route("/{id}/cancel", post(builds::cancel_build))
        .route("/{id}/logs", get(builds::build_logs))
        .route("/{id}/patch", get(builds::build_patch))
        .route("/{id}/ws", get(ws::build_ws_handler))
}
