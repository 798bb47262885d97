//! WebSocket infrastructure for live build output.
//!
//! Provides connection management, heartbeat monitoring, and the HTTP
//! upgrade handler used by the build routes.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::build_ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
