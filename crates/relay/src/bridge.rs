//! The relay bridge: mirrors the node's latest status and forwards commands
//! onto the broker session, but only while that session is up.

use rumqttc::{AsyncClient, QoS};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{RelayCache, StatusView};
use crate::events::{EventKind, EventLog, RelayEvent};
use crate::protocol::{encode_command, CommandRequest, TelemetrySnapshot};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("not connected")]
    NotConnected,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Outbound half of the broker session.
pub trait CommandSink: Send + Sync + 'static {
    fn publish_command(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;
}

impl CommandSink for AsyncClient {
    fn publish_command(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }
}

pub struct RelayBridge<S> {
    cache: RelayCache,
    events: EventLog,
    sink: S,
    control_topic: String,
}

impl<S: CommandSink> RelayBridge<S> {
    pub fn new(sink: S, control_topic: String) -> Self {
        Self {
            cache: RelayCache::new(),
            events: EventLog::new(),
            sink,
            control_topic,
        }
    }

    pub async fn record_snapshot(&self, snapshot: TelemetrySnapshot) {
        debug!(
            device_id = %snapshot.device_id,
            moisture = snapshot.moisture,
            pump = ?snapshot.pump_state,
            "status received"
        );
        let detail = format!(
            "{}: moisture {}% pump {:?} mode {:?}",
            snapshot.device_id, snapshot.moisture, snapshot.pump_state, snapshot.mode
        );
        self.cache.record_snapshot(snapshot);
        self.events.record(EventKind::Telemetry, detail).await;
    }

    pub async fn record_connectivity(&self, connected: bool) {
        let previous = self.cache.record_connectivity(connected);
        if previous != connected {
            info!(connected, "broker connectivity changed");
            let detail = if connected { "connected" } else { "disconnected" };
            self.events.record(EventKind::Connectivity, detail.into()).await;
        }
    }

    pub async fn record_error(&self, detail: String) {
        self.events.record(EventKind::Error, detail).await;
    }

    pub fn status(&self) -> StatusView {
        self.cache.status()
    }

    /// Forward `cmd` to the node. Refused outright while disconnected; no
    /// retry is queued either way.
    pub async fn send_command(&self, cmd: &CommandRequest) -> Result<(), BridgeError> {
        if !self.cache.is_connected() {
            warn!(command = %cmd.command, "command refused, broker not connected");
            self.events
                .record(EventKind::Command, format!("{} refused: not connected", cmd.command))
                .await;
            return Err(BridgeError::NotConnected);
        }

        let payload = encode_command(cmd)?;
        if let Err(e) = self.sink.publish_command(&self.control_topic, payload) {
            warn!(command = %cmd.command, error = %e, "command publish failed");
            self.events
                .record(EventKind::Error, format!("{} not forwarded: {e}", cmd.command))
                .await;
            return Err(e);
        }

        info!(command = %cmd.command, topic = %self.control_topic, "command forwarded");
        self.events
            .record(EventKind::Command, format!("{} forwarded", cmd.command))
            .await;
        Ok(())
    }

    pub async fn recent_events(&self) -> Vec<RelayEvent> {
        self.events.recent().await
    }
}

// ---------------------------------------------------------------------------
// Recording sink (tests)
// ---------------------------------------------------------------------------
