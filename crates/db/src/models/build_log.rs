//! Stored build output lines.

use archery_core::log_stream::OutputChannel;
use archery_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `build_log_lines` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BuildLogLine {
    pub id: DbId,
    pub build_id: DbId,
    pub channel: String,
    pub line: String,
    pub created_at: Timestamp,
}

impl BuildLogLine {
    pub fn output_channel(&self) -> OutputChannel {
        OutputChannel::from_name(&self.channel)
    }
}
