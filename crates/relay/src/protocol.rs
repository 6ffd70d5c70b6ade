//! Wire types as the relay sees them: snapshots come in on the status topic,
//! commands go out on the control topic.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    On,
    Off,
}

/// Status record published by the node. Every field is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub moisture: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub threshold: u8,
    pub pump_state: PumpState,
    pub mode: Mode,
    pub change_threshold: u8,
    pub uptime: u64,
    pub signal_quality: i32,
}

pub fn decode_snapshot(payload: &[u8]) -> serde_json::Result<TelemetrySnapshot> {
    serde_json::from_slice(payload)
}

/// Command as accepted from API clients and forwarded to the node. The relay
/// does not interpret it; the node validates tags and ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
}

pub fn encode_command(cmd: &CommandRequest) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(cmd)
}
