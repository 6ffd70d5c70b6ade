//! Irrigation controller: operating mode, pump state, thresholds and the
//! safety cutoff.
//!
//! ```text
//!            moisture < threshold
//!   ┌─────┐ ─────────────────────▶ ┌────┐
//!   │ OFF │                        │ ON │   (auto mode)
//!   └─────┘ ◀───────────────────── └────┘
//!      ▲     moisture >= threshold    │
//!      └──── runtime >= max ──────────┘     (any mode, latches in auto)
//! ```
//!
//! The state is owned by the control loop and passed into every operation;
//! nothing here touches hardware or the network.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::logging::LogLevel;
use crate::protocol::{CommandMessage, Mode, PumpState, TelemetrySnapshot};
use crate::sensor::MoistureReading;

pub const THRESHOLD_RANGE: RangeInclusive<i64> = 0..=100;
pub const CHANGE_THRESHOLD_RANGE: RangeInclusive<i64> = 1..=20;

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub moisture_threshold: u8,
    pub change_threshold: u8,
    pub max_pump_runtime: Duration,
}

/// What `tick` did to the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    PumpStarted,
    PumpStopped,
    SafetyCutoff,
}

/// Result of processing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// Valid command that does not apply in the current state.
    Ignored(&'static str),
    /// Value outside its accepted range; previous value kept.
    Rejected(String),
    Unrecognized,
}

impl CommandOutcome {
    /// Recognized commands are always echoed with a fresh snapshot, whether
    /// or not they changed anything.
    pub fn echo(&self) -> bool {
        !matches!(self, Self::Unrecognized)
    }
}

/// Per-publish values the controller does not own.
pub struct SnapshotMeta<'a> {
    pub device_id: &'a str,
    pub timestamp: OffsetDateTime,
    pub uptime_secs: u64,
    pub signal_quality: i32,
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    mode: Mode,
    pump_on: bool,
    moisture_threshold: u8,
    change_threshold: u8,
    pump_started_at: Option<Instant>,
    max_pump_runtime: Duration,
    log_level: LogLevel,
    moisture: Option<MoistureReading>,
    /// Set by a safety cutoff in auto mode; cleared once moisture recovers.
    cutoff_latched: bool,
}

impl ControllerState {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            mode: Mode::Auto,
            pump_on: false,
            moisture_threshold: settings.moisture_threshold,
            change_threshold: settings.change_threshold,
            pump_started_at: None,
            max_pump_runtime: settings.max_pump_runtime,
            log_level: LogLevel::Info,
            moisture: None,
            cutoff_latched: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pump_on(&self) -> bool {
        self.pump_on
    }

    pub fn moisture_threshold(&self) -> u8 {
        self.moisture_threshold
    }

    pub fn change_threshold(&self) -> u8 {
        self.change_threshold
    }

    pub fn pump_started_at(&self) -> Option<Instant> {
        self.pump_started_at
    }

    /// When a running pump must be forced off.
    pub fn cutoff_deadline(&self) -> Option<Instant> {
        self.pump_started_at
            .filter(|_| self.pump_on)
            .map(|started| started + self.max_pump_runtime)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn moisture(&self) -> Option<MoistureReading> {
        self.moisture
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Feed one sensor reading. Auto mode follows the threshold; manual mode
    /// only records the reading. The safety cutoff runs first in both.
    pub fn tick(&mut self, reading: MoistureReading, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::Unchanged;
        if self.enforce_safety(now) {
            outcome = TickOutcome::SafetyCutoff;
        }

        self.moisture = Some(reading);
        if self.mode != Mode::Auto {
            return outcome;
        }

        let moisture = reading.percent();
        if moisture >= self.moisture_threshold {
            self.cutoff_latched = false;
        }

        if !self.pump_on && moisture < self.moisture_threshold && !self.cutoff_latched {
            self.start_pump(now);
            info!(moisture, threshold = self.moisture_threshold, "auto: moisture below threshold, pump on");
            outcome = TickOutcome::PumpStarted;
        } else if self.pump_on && moisture >= self.moisture_threshold {
            self.stop_pump();
            info!(moisture, threshold = self.moisture_threshold, "auto: threshold reached, pump off");
            outcome = TickOutcome::PumpStopped;
        }

        outcome
    }

    /// Force the pump off once it has run for `max_pump_runtime`. Returns
    /// true when it fired.
    pub fn enforce_safety(&mut self, now: Instant) -> bool {
        let Some(started) = self.pump_started_at.filter(|_| self.pump_on) else {
            return false;
        };

        let ran = now.saturating_duration_since(started);
        if ran < self.max_pump_runtime {
            return false;
        }

        self.stop_pump();
        if self.mode == Mode::Auto {
            self.cutoff_latched = true;
        }
        warn!(
            ran_ms = ran.as_millis() as u64,
            max_ms = self.max_pump_runtime.as_millis() as u64,
            "safety cutoff: pump forced off"
        );
        true
    }

    pub fn apply_command(&mut self, cmd: &CommandMessage, now: Instant) -> CommandOutcome {
        let outcome = match cmd {
            CommandMessage::Pump(state) => self.apply_pump(*state, now),
            CommandMessage::Mode(mode) => {
                self.mode = *mode;
                self.stop_pump();
                self.cutoff_latched = false;
                info!(?mode, "mode set, pump off");
                CommandOutcome::Applied
            }
            CommandMessage::Threshold(v) => match checked(*v, THRESHOLD_RANGE) {
                Some(v) => {
                    self.moisture_threshold = v;
                    info!(threshold = v, "moisture threshold updated");
                    CommandOutcome::Applied
                }
                None => rejected("threshold", *v, THRESHOLD_RANGE, self.moisture_threshold),
            },
            CommandMessage::ChangeThreshold(v) => match checked(*v, CHANGE_THRESHOLD_RANGE) {
                Some(v) => {
                    self.change_threshold = v;
                    info!(change_threshold = v, "change threshold updated");
                    CommandOutcome::Applied
                }
                None => rejected(
                    "change_threshold",
                    *v,
                    CHANGE_THRESHOLD_RANGE,
                    self.change_threshold,
                ),
            },
            CommandMessage::LogLevel(v) => match LogLevel::from_code(*v) {
                Some(level) => {
                    self.log_level = level;
                    info!(?level, "log level updated");
                    CommandOutcome::Applied
                }
                None => {
                    warn!(level = *v, "log level outside 0..=4, ignored");
                    CommandOutcome::Rejected(format!("log level {v} outside 0..=4"))
                }
            },
            CommandMessage::Unrecognized(tag) => {
                warn!(command = %tag, "unrecognized command dropped");
                CommandOutcome::Unrecognized
            }
        };

        // A command can never keep the pump running past its limit.
        self.enforce_safety(now);
        outcome
    }

    fn apply_pump(&mut self, state: PumpState, now: Instant) -> CommandOutcome {
        if self.mode == Mode::Auto {
            info!(?state, "pump command ignored in auto mode");
            return CommandOutcome::Ignored("pump commands only apply in manual mode");
        }
        match state {
            // Already running: keep the original start so the cutoff still counts from it.
            PumpState::On if self.pump_on => {}
            PumpState::On => self.start_pump(now),
            PumpState::Off => self.stop_pump(),
        }
        info!(?state, "manual pump command applied");
        CommandOutcome::Applied
    }

    /// Pure read of the current state.
    pub fn snapshot(&self, meta: &SnapshotMeta<'_>) -> TelemetrySnapshot {
        TelemetrySnapshot {
            device_id: meta.device_id.to_string(),
            moisture: self.moisture.map_or(0, MoistureReading::percent),
            timestamp: meta.timestamp,
            threshold: self.moisture_threshold,
            pump_state: PumpState::from(self.pump_on),
            mode: self.mode,
            change_threshold: self.change_threshold,
            uptime: meta.uptime_secs,
            signal_quality: meta.signal_quality,
        }
    }

    fn start_pump(&mut self, now: Instant) {
        self.pump_on = true;
        self.pump_started_at = Some(now);
    }

    fn stop_pump(&mut self) {
        self.pump_on = false;
        self.pump_started_at = None;
    }
}

fn checked(v: i64, range: RangeInclusive<i64>) -> Option<u8> {
    if range.contains(&v) {
        u8::try_from(v).ok()
    } else {
        None
    }
}

fn rejected(field: &str, v: i64, range: RangeInclusive<i64>, kept: u8) -> CommandOutcome {
    warn!(
        field,
        value = v,
        min = *range.start(),
        max = *range.end(),
        kept,
        "command value out of range, rejected"
    );
    CommandOutcome::Rejected(format!(
        "{field} {v} outside {}..={}",
        range.start(),
        range.end()
    ))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_RUNTIME: Duration = Duration::from_secs(30);

    fn settings() -> ControllerSettings {
        ControllerSettings {
            moisture_threshold: 30,
            change_threshold: 5,
            max_pump_runtime: MAX_RUNTIME,
        }
    }

    fn pct(p: u8) -> MoistureReading {
        MoistureReading::from_percent(p)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn manual(state: &mut ControllerState, now: Instant) {
        state.apply_command(&CommandMessage::Mode(Mode::Manual), now);
    }

    /// pump_on implies a recorded start time.
    fn assert_invariant(state: &ControllerState) {
        if state.pump_on() {
            assert!(state.pump_started_at().is_some(), "pump on without start time");
        }
    }

    // -- Auto mode --------------------------------------------------------

    #[test]
    fn auto_dry_soil_turns_pump_on() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        assert_eq!(st.tick(pct(25), t0), TickOutcome::PumpStarted);
        assert!(st.pump_on());
        assert_eq!(st.pump_started_at(), Some(t0));
    }

    #[test]
    fn auto_moisture_recovers_turns_pump_off() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        st.tick(pct(25), t0);
        assert_eq!(st.tick(pct(31), t0 + secs(5)), TickOutcome::PumpStopped);
        assert!(!st.pump_on());
        assert_eq!(st.pump_started_at(), None);
    }

    #[test]
    fn auto_at_threshold_counts_as_wet() {
        let mut st = ControllerState::new(settings());
        assert_eq!(st.tick(pct(30), Instant::now()), TickOutcome::Unchanged);
        assert!(!st.pump_on());
    }

    #[test]
    fn auto_one_transition_per_crossing() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        let seq = [40, 35, 29, 27, 25, 28, 30, 33, 29, 26, 31];
        let mut starts = 0;
        let mut stops = 0;
        for (i, m) in seq.iter().enumerate() {
            match st.tick(pct(*m), t0 + secs(i as u64)) {
                TickOutcome::PumpStarted => starts += 1,
                TickOutcome::PumpStopped => stops += 1,
                _ => {}
            }
            assert_invariant(&st);
        }
        // Two downward crossings (29, 29) and two recoveries (30, 31).
        assert_eq!(starts, 2);
        assert_eq!(stops, 2);
    }

    // -- Manual mode ------------------------------------------------------

    #[test]
    fn manual_mode_ignores_moisture() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        manual(&mut st, t0);
        assert_eq!(st.tick(pct(5), t0), TickOutcome::Unchanged);
        assert!(!st.pump_on());

        st.apply_command(&CommandMessage::Pump(PumpState::On), t0);
        assert_eq!(st.tick(pct(95), t0 + secs(1)), TickOutcome::Unchanged);
        assert!(st.pump_on());
    }

    #[test]
    fn pump_command_ignored_in_auto() {
        let mut st = ControllerState::new(settings());
        let out = st.apply_command(&CommandMessage::Pump(PumpState::On), Instant::now());
        assert!(matches!(out, CommandOutcome::Ignored(_)));
        assert!(!st.pump_on());
        assert!(out.echo());
    }

    #[test]
    fn pump_off_command_ignored_in_auto_while_running() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        st.tick(pct(10), t0);
        let out = st.apply_command(&CommandMessage::Pump(PumpState::Off), t0);
        assert!(matches!(out, CommandOutcome::Ignored(_)));
        assert!(st.pump_on());
    }

    #[test]
    fn manual_pump_on_and_off() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        manual(&mut st, t0);
        assert_eq!(
            st.apply_command(&CommandMessage::Pump(PumpState::On), t0),
            CommandOutcome::Applied
        );
        assert!(st.pump_on());
        assert_invariant(&st);
        st.apply_command(&CommandMessage::Pump(PumpState::Off), t0 + secs(3));
        assert!(!st.pump_on());
        assert_eq!(st.pump_started_at(), None);
    }

    #[test]
    fn repeated_pump_on_keeps_start_time() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        manual(&mut st, t0);
        st.apply_command(&CommandMessage::Pump(PumpState::On), t0);
        st.apply_command(&CommandMessage::Pump(PumpState::On), t0 + secs(20));
        assert_eq!(st.pump_started_at(), Some(t0));

        // ...so the cutoff still fires 30s after the first command.
        st.apply_command(&CommandMessage::Pump(PumpState::On), t0 + secs(30));
        assert!(!st.pump_on());
    }

    // -- Mode -------------------------------------------------------------

    #[test]
    fn mode_change_forces_pump_off() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        st.tick(pct(20), t0);
        assert!(st.pump_on());

        st.apply_command(&CommandMessage::Mode(Mode::Manual), t0 + secs(1));
        assert_eq!(st.mode(), Mode::Manual);
        assert!(!st.pump_on());
        assert_eq!(st.pump_started_at(), None);
    }

    #[test]
    fn same_mode_still_forces_pump_off() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        manual(&mut st, t0);
        st.apply_command(&CommandMessage::Pump(PumpState::On), t0);

        st.apply_command(&CommandMessage::Mode(Mode::Manual), t0 + secs(1));
        assert_eq!(st.mode(), Mode::Manual);
        assert!(!st.pump_on());
    }

    #[test]
    fn any_mode_command_leaves_pump_off() {
        for (start_on, target) in [
            (true, Mode::Auto),
            (true, Mode::Manual),
            (false, Mode::Auto),
            (false, Mode::Manual),
        ] {
            let mut st = ControllerState::new(settings());
            let t0 = Instant::now();
            manual(&mut st, t0);
            if start_on {
                st.apply_command(&CommandMessage::Pump(PumpState::On), t0);
            }
            st.apply_command(&CommandMessage::Mode(target), t0);
            assert!(!st.pump_on(), "start_on={start_on} target={target:?}");
        }
    }

    // -- Thresholds -------------------------------------------------------

    #[test]
    fn threshold_in_range_is_applied() {
        for v in [0, 1, 30, 99, 100] {
            let mut st = ControllerState::new(settings());
            let out = st.apply_command(&CommandMessage::Threshold(v), Instant::now());
            assert_eq!(out, CommandOutcome::Applied);
            assert_eq!(i64::from(st.moisture_threshold()), v);
        }
    }

    #[test]
    fn threshold_out_of_range_keeps_previous() {
        for v in [-1, 101, 150, i64::MAX, i64::MIN] {
            let mut st = ControllerState::new(settings());
            let out = st.apply_command(&CommandMessage::Threshold(v), Instant::now());
            assert!(matches!(out, CommandOutcome::Rejected(_)), "v={v}");
            assert_eq!(st.moisture_threshold(), 30);
            assert!(out.echo(), "rejections are still echoed");
        }
    }

    #[test]
    fn change_threshold_bounds() {
        let mut st = ControllerState::new(settings());
        let now = Instant::now();
        assert_eq!(st.apply_command(&CommandMessage::ChangeThreshold(1), now), CommandOutcome::Applied);
        assert_eq!(st.change_threshold(), 1);
        assert_eq!(st.apply_command(&CommandMessage::ChangeThreshold(20), now), CommandOutcome::Applied);
        assert_eq!(st.change_threshold(), 20);

        for v in [0, 21, -5] {
            let out = st.apply_command(&CommandMessage::ChangeThreshold(v), now);
            assert!(matches!(out, CommandOutcome::Rejected(_)));
            assert_eq!(st.change_threshold(), 20);
        }
    }

    #[test]
    fn log_level_within_enumeration() {
        let mut st = ControllerState::new(settings());
        let now = Instant::now();
        assert_eq!(st.apply_command(&CommandMessage::LogLevel(4), now), CommandOutcome::Applied);
        assert_eq!(st.log_level(), LogLevel::Debug);

        let out = st.apply_command(&CommandMessage::LogLevel(9), now);
        assert!(matches!(out, CommandOutcome::Rejected(_)));
        assert_eq!(st.log_level(), LogLevel::Debug);
    }

    #[test]
    fn unrecognized_is_not_echoed() {
        let mut st = ControllerState::new(settings());
        let before = st.clone();
        let out = st.apply_command(&CommandMessage::Unrecognized("reboot".into()), Instant::now());
        assert_eq!(out, CommandOutcome::Unrecognized);
        assert!(!out.echo());
        assert_eq!(st.mode(), before.mode());
        assert_eq!(st.moisture_threshold(), before.moisture_threshold());
    }

    // -- Safety cutoff ----------------------------------------------------

    #[test]
    fn manual_pump_cut_off_after_max_runtime() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        manual(&mut st, t0);
        st.apply_command(&CommandMessage::Pump(PumpState::On), t0);

        assert_eq!(st.tick(pct(50), t0 + secs(29)), TickOutcome::Unchanged);
        assert!(st.pump_on());
        assert_eq!(st.tick(pct(50), t0 + secs(30)), TickOutcome::SafetyCutoff);
        assert!(!st.pump_on());
        assert_eq!(st.mode(), Mode::Manual);
    }

    #[test]
    fn auto_cutoff_latches_until_moisture_recovers() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        st.tick(pct(10), t0);
        assert_eq!(st.tick(pct(12), t0 + MAX_RUNTIME), TickOutcome::SafetyCutoff);
        assert!(!st.pump_on());

        // Still dry, but the same crossing must not restart the pump.
        assert_eq!(st.tick(pct(12), t0 + secs(31)), TickOutcome::Unchanged);
        assert!(!st.pump_on());

        // Recover, then dry out again: a new crossing re-arms.
        st.tick(pct(35), t0 + secs(60));
        assert_eq!(st.tick(pct(20), t0 + secs(61)), TickOutcome::PumpStarted);
    }

    #[test]
    fn mode_command_clears_cutoff_latch() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        st.tick(pct(10), t0);
        st.tick(pct(10), t0 + MAX_RUNTIME);
        st.apply_command(&CommandMessage::Mode(Mode::Auto), t0 + secs(31));
        assert_eq!(st.tick(pct(10), t0 + secs(32)), TickOutcome::PumpStarted);
    }

    #[test]
    fn runtime_never_exceeds_max_under_tick_stream() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        manual(&mut st, t0);
        st.apply_command(&CommandMessage::Pump(PumpState::On), t0);

        let mut longest = Duration::ZERO;
        for s in 0..120 {
            let now = t0 + secs(s);
            st.tick(pct(50), now);
            if let Some(started) = st.pump_started_at() {
                longest = longest.max(now - started);
            }
            // Operator keeps asking for water every 10s.
            if s % 10 == 0 {
                st.apply_command(&CommandMessage::Pump(PumpState::On), now);
            }
            assert_invariant(&st);
        }
        assert!(longest < MAX_RUNTIME, "ran {longest:?}");
    }

    #[test]
    fn cutoff_deadline_only_while_running() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        assert_eq!(st.cutoff_deadline(), None);

        st.tick(pct(10), t0);
        assert_eq!(st.cutoff_deadline(), Some(t0 + st.max_pump_runtime));

        st.tick(pct(80), t0 + secs(5));
        assert_eq!(st.cutoff_deadline(), None);
    }

    #[test]
    fn enforce_safety_is_noop_when_off() {
        let mut st = ControllerState::new(settings());
        assert!(!st.enforce_safety(Instant::now() + secs(3600)));
    }

    // -- Snapshot ---------------------------------------------------------

    #[test]
    fn snapshot_reflects_state() {
        let mut st = ControllerState::new(settings());
        let t0 = Instant::now();
        st.tick(pct(22), t0);

        let meta = SnapshotMeta {
            device_id: "basil",
            timestamp: OffsetDateTime::UNIX_EPOCH,
            uptime_secs: 12,
            signal_quality: -60,
        };
        let snap = st.snapshot(&meta);
        assert_eq!(snap.device_id, "basil");
        assert_eq!(snap.moisture, 22);
        assert_eq!(snap.threshold, 30);
        assert_eq!(snap.pump_state, PumpState::On);
        assert_eq!(snap.mode, Mode::Auto);
        assert_eq!(snap.change_threshold, 5);
        assert_eq!(snap.uptime, 12);
        assert_eq!(snap.signal_quality, -60);

        // Pure read.
        let again = st.snapshot(&meta);
        assert_eq!(snap, again);
        assert!(st.pump_on());
    }

    #[test]
    fn snapshot_before_first_reading_reports_zero_moisture() {
        let st = ControllerState::new(settings());
        let meta = SnapshotMeta {
            device_id: "basil",
            timestamp: OffsetDateTime::UNIX_EPOCH,
            uptime_secs: 0,
            signal_quality: 0,
        };
        assert_eq!(st.snapshot(&meta).moisture, 0);
    }
}
