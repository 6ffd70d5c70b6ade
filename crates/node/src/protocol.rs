use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    On,
    Off,
}

impl From<bool> for PumpState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: telemetry snapshot (status topic)
// ---------------------------------------------------------------------------

/// One fully-populated status record. Field order here is the field order on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
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

pub fn encode_snapshot(snapshot: &TelemetrySnapshot) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(snapshot)
}

// ---------------------------------------------------------------------------
// Inbound: commands (control topic)
// ---------------------------------------------------------------------------

/// A decoded control message. Numeric values are carried as received; range
/// checks belong to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMessage {
    Pump(PumpState),
    Mode(Mode),
    Threshold(i64),
    ChangeThreshold(i64),
    LogLevel(i64),
    /// A well-formed message whose `command` tag we do not know.
    Unrecognized(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed command payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("'{command}' command is missing field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("'{command}' command has invalid {field} {value:?}")]
    InvalidField {
        command: &'static str,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    command: String,
    state: Option<String>,
    value: Option<i64>,
    level: Option<i64>,
}

pub fn decode_command(payload: &[u8]) -> Result<CommandMessage, DecodeError> {
    let raw: RawCommand = serde_json::from_slice(payload)?;

    let cmd = match raw.command.as_str() {
        "pump" => {
            let state = require(raw.state, "pump", "state")?;
            match normalise(&state).as_str() {
                "on" => CommandMessage::Pump(PumpState::On),
                "off" => CommandMessage::Pump(PumpState::Off),
                _ => return Err(invalid("pump", "state", state)),
            }
        }
        "mode" => {
            let state = require(raw.state, "mode", "state")?;
            match normalise(&state).as_str() {
                "auto" => CommandMessage::Mode(Mode::Auto),
                "manual" => CommandMessage::Mode(Mode::Manual),
                _ => return Err(invalid("mode", "state", state)),
            }
        }
        "threshold" => CommandMessage::Threshold(require(raw.value, "threshold", "value")?),
        "change_threshold" => {
            CommandMessage::ChangeThreshold(require(raw.value, "change_threshold", "value")?)
        }
        // Older dashboards send the level in `value`.
        "log_level" => CommandMessage::LogLevel(require(raw.level.or(raw.value), "log_level", "level")?),
        other => CommandMessage::Unrecognized(other.to_string()),
    };

    Ok(cmd)
}

fn require<T>(field: Option<T>, command: &'static str, name: &'static str) -> Result<T, DecodeError> {
    field.ok_or(DecodeError::MissingField {
        command,
        field: name,
    })
}

fn invalid(command: &'static str, field: &'static str, value: String) -> DecodeError {
    DecodeError::InvalidField {
        command,
        field,
        value,
    }
}

fn normalise(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

// ===========================================================================
// Tests
// ===========================================================================
