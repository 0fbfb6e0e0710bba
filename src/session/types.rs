//! Session Types and Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::health::HealthSample;

/// Session lifecycle state
///
/// `Disconnected → Connecting → Connected → Disconnected`. There is no
/// separate reconnecting state; a new connect starts from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl SessionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Direction of a logged terminal chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Bytes written to the remote stdin
    Input,
    /// Bytes read from the remote stdout/stderr
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Append-only record of terminal I/O
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub data: Vec<u8>,
}

impl SessionLogEntry {
    pub fn new(session_id: impl Into<String>, direction: Direction, data: Vec<u8>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            direction,
            data,
        }
    }
}

/// Session info for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub log_entries: usize,
    pub tunnels: usize,
    pub last_health: Option<HealthSample>,
}
