//! The node's control loop: one `step` per tick.
//!
//! Each step makes sure the session is up, reads the sensor, lets the
//! controller act, publishes when the scheduler says so, then spends the rest
//! of the tick handling inbound commands. Nothing in here returns an error;
//! failures are logged and the next step runs regardless.

use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::controller::{CommandOutcome, ControllerState, SnapshotMeta};
use crate::logging::LevelControl;
use crate::protocol::{decode_command, encode_snapshot, CommandMessage};
use crate::pump::Pump;
use crate::scheduler::{PublishReason, TelemetryScheduler};
use crate::sensor::{Calibration, MoistureReading, MoistureSource};
use crate::session::{Connect, InboundMessage, SessionManager, SessionState, Transport};
use crate::wireless;

pub struct Node<T, C> {
    session: SessionManager<T, C>,
    clock: C,
    controller: ControllerState,
    scheduler: TelemetryScheduler,
    sensor: Box<dyn MoistureSource>,
    calibration: Calibration,
    pump: Pump,
    log: Option<Box<dyn LevelControl>>,
    device_id: String,
    status_topic: String,
    control_topic: String,
    tick: Duration,
    wireless_iface: String,
    started: Instant,
}

impl<T: Transport, C: Clock + Clone> Node<T, C> {
    pub fn new(
        config: &NodeConfig,
        transport: T,
        clock: C,
        sensor: Box<dyn MoistureSource>,
        pump: Pump,
        log: Option<Box<dyn LevelControl>>,
    ) -> Self {
        let control_topic = config.control_topic();
        let settings = config.controller_settings();
        let started = clock.now();
        Self {
            session: SessionManager::new(
                transport,
                clock.clone(),
                control_topic.clone(),
                config.retry_delay(),
            ),
            scheduler: TelemetryScheduler::new(config.publish_interval(), started),
            controller: ControllerState::new(settings),
            clock,
            sensor,
            calibration: config.calibration(),
            pump,
            log,
            device_id: config.device_id.clone(),
            status_topic: config.status_topic(),
            control_topic,
            tick: config.tick(),
            wireless_iface: config.wireless.interface.clone(),
            started,
        }
    }

    pub fn controller(&self) -> &ControllerState {
        &self.controller
    }

    pub async fn step(&mut self) {
        // The pump keeps its cutoff while the broker is unreachable.
        let Self {
            session,
            controller,
            pump,
            sensor,
            ..
        } = self;
        let connect = session
            .ensure_connected(|now| {
                if controller.enforce_safety(now) {
                    drive_outputs(controller.pump_on(), pump, &mut **sensor);
                }
                controller.cutoff_deadline()
            })
            .await;

        if connect == Connect::Established {
            if self.controller.enforce_safety(self.clock.now()) {
                self.sync_outputs();
            }
            self.publish(PublishReason::Connected);
        }

        let now = self.clock.now();
        match self.sensor.read_raw() {
            Ok(raw) => {
                let reading = MoistureReading::from_raw(raw, self.calibration);
                let outcome = self.controller.tick(reading, now);
                debug!(raw, moisture = reading.percent(), ?outcome, "tick");
            }
            Err(e) => {
                warn!(error = %e, "sensor read failed, skipping moisture control");
                self.controller.enforce_safety(now);
            }
        }
        self.sync_outputs();

        let moisture = self.controller.moisture().map(MoistureReading::percent);
        if let Some(reason) = self
            .scheduler
            .poll(moisture, self.controller.change_threshold(), now)
        {
            self.publish(reason);
        }

        self.drain_inbound(now + self.tick).await;
    }

    /// Handle inbound messages until `deadline`. Waits are cut short so the
    /// safety cutoff fires on time even between ticks, with or without a
    /// session.
    async fn drain_inbound(&mut self, deadline: Instant) {
        loop {
            let now = self.clock.now();
            if self.controller.enforce_safety(now) {
                self.sync_outputs();
            }

            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                return;
            }
            let wait = match self.controller.cutoff_deadline() {
                Some(cutoff) => remaining.min(cutoff.saturating_duration_since(now)),
                None => remaining,
            };

            if self.session.state() != SessionState::SessionUp {
                // Reconnect on the next step.
                self.clock.sleep(wait).await;
                continue;
            }

            match self.session.next_message(wait).await {
                Ok(Some(msg)) => self.handle_message(msg),
                Ok(None) if wait == remaining => return,
                Ok(None) | Err(_) => {}
            }
        }
    }

    fn handle_message(&mut self, msg: InboundMessage) {
        if msg.topic != self.control_topic {
            debug!(topic = %msg.topic, "ignoring message on unexpected topic");
            return;
        }

        let cmd = match decode_command(&msg.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "dropping malformed command");
                return;
            }
        };

        let outcome = self.controller.apply_command(&cmd, self.clock.now());
        debug!(?cmd, ?outcome, "command processed");
        self.sync_outputs();

        // Applied even when unchanged: RUST_LOG may have set something else.
        if matches!(cmd, CommandMessage::LogLevel(_)) && outcome == CommandOutcome::Applied {
            if let Some(log) = &self.log {
                if let Err(e) = log.apply(self.controller.log_level()) {
                    warn!(error = %e, "could not apply log level");
                }
            }
        }

        if outcome.echo() {
            self.publish(PublishReason::CommandEcho);
        }
    }

    fn sync_outputs(&mut self) {
        drive_outputs(self.controller.pump_on(), &mut self.pump, &mut *self.sensor);
    }

    fn publish(&mut self, reason: PublishReason) {
        let meta = SnapshotMeta {
            device_id: &self.device_id,
            timestamp: OffsetDateTime::now_utc(),
            uptime_secs: self.clock.now().saturating_duration_since(self.started).as_secs(),
            signal_quality: wireless::signal_quality(&self.wireless_iface),
        };
        let snapshot = self.controller.snapshot(&meta);

        let payload = match encode_snapshot(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%reason, error = %e, "failed to encode status");
                return;
            }
        };

        match self.session.publish(&self.status_topic, payload) {
            Ok(()) => debug!(%reason, moisture = snapshot.moisture, "status published"),
            Err(e) => warn!(%reason, error = %e, "status publish failed"),
        }
    }

    /// Leave the pump off and the session closed.
    pub fn shutdown(&mut self) {
        self.pump.set(false);
        self.sensor.set_watering(false);
        self.session.go_offline();
    }

    #[cfg(test)]
    fn transport(&mut self) -> &mut T {
        self.session.transport_mut()
    }
}

fn drive_outputs(on: bool, pump: &mut Pump, sensor: &mut dyn MoistureSource) {
    pump.set(on);
    sensor.set_watering(on);
}

// ===========================================================================
// Tests
// ===========================================================================
