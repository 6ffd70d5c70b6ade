//! Telemetry scheduler: decides when the node publishes a status snapshot.
//!
//! Two triggers run side by side, each with its own reset:
//!
//! - **periodic**: every `interval`, whatever the data is doing;
//! - **moisture change**: the reading moved by at least `change_threshold`
//!   since the last change-triggered publish. There is no baseline before
//!   the first reading, so the first reading always publishes.
//!
//! Command echoes and post-connect publishes go out through the control loop
//! directly and leave both triggers alone.

use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReason {
    Periodic,
    MoistureChange,
    CommandEcho,
    Connected,
}

impl fmt::Display for PublishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Periodic => "periodic",
            Self::MoistureChange => "moisture_change",
            Self::CommandEcho => "command_echo",
            Self::Connected => "connected",
        })
    }
}

pub struct TelemetryScheduler {
    interval: Duration,
    last_periodic: Instant,
    last_published_moisture: Option<u8>,
}

impl TelemetryScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_periodic: now,
            last_published_moisture: None,
        }
    }

    /// Check both triggers for this tick. A trigger that fires is reset; if
    /// both fire, one publish covers both.
    pub fn poll(
        &mut self,
        moisture: Option<u8>,
        change_threshold: u8,
        now: Instant,
    ) -> Option<PublishReason> {
        let periodic = now.saturating_duration_since(self.last_periodic) >= self.interval;
        let changed = match (moisture, self.last_published_moisture) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(m), Some(prev)) => m.abs_diff(prev) >= change_threshold,
        };

        if periodic {
            self.last_periodic = now;
        }
        if changed {
            self.last_published_moisture = moisture;
        }

        match (periodic, changed) {
            (true, _) => Some(PublishReason::Periodic),
            (false, true) => Some(PublishReason::MoistureChange),
            (false, false) => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
