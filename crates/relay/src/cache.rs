//! Latest-value cache: one snapshot slot and one connectivity flag.
//!
//! Both live in `watch` channels, so readers take a cheap borrow of the
//! current value and never wait on the MQTT task. The two slots are updated
//! independently and a reader may see them from slightly different moments.

use tokio::sync::watch;

use crate::protocol::TelemetrySnapshot;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub connected: bool,
    /// `None` until the first snapshot arrives.
    pub latest: Option<TelemetrySnapshot>,
}

pub struct RelayCache {
    latest: watch::Sender<Option<TelemetrySnapshot>>,
    connected: watch::Sender<bool>,
}

impl RelayCache {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        let (connected, _) = watch::channel(false);
        Self { latest, connected }
    }

    /// Last write wins.
    pub fn record_snapshot(&self, snapshot: TelemetrySnapshot) {
        self.latest.send_replace(Some(snapshot));
    }

    /// Returns the previous value.
    pub fn record_connectivity(&self, connected: bool) -> bool {
        self.connected.send_replace(connected)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn status(&self) -> StatusView {
        StatusView {
            connected: self.is_connected(),
            latest: self.latest.borrow().clone(),
        }
    }
}

impl Default for RelayCache {
    fn default() -> Self {
        Self::new()
    }
}
