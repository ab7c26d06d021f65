//! tabcal protocol
//!
//! Shared types for the frames the browser extension sends over the local
//! WebSocket, plus the 12-hour timestamp format they carry. These types are
//! serialized as JSON over WebSocket.

pub mod time;

pub use time::{format_recorded_time, parse_recorded_time, TimeParseError};

use serde::{Deserialize, Serialize};

/// What a frame's timestamp marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeType {
    Start,
    End,
    /// Anything the extension adds later (heartbeats, focus pings) is a
    /// plain update.
    #[serde(other)]
    Other,
}

impl TimeType {
    pub fn is_end(self) -> bool {
        self == TimeType::End
    }
}

/// One tab-activity frame from the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMessage {
    pub url: String,
    /// `MM/DD/YYYY, HH:MM:SS AM|PM`, see [`time::parse_recorded_time`].
    #[serde(rename = "recordedTime")]
    pub recorded_time: String,
    #[serde(rename = "timeType")]
    pub time_type: TimeType,
}
