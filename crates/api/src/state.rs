use std::sync::Arc;

use archery_worker::Dispatcher;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: archery_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// WebSocket connection manager (build log viewers).
    pub ws_manager: Arc<WsManager>,
    /// Build event bus the dispatcher publishes to.
    pub event_bus: Arc<archery_events::EventBus>,
    /// Build queue dispatcher.
    pub dispatcher: Dispatcher,
}
