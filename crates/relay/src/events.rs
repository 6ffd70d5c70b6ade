use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Connectivity,
    Error,
}

/// Rolling in-memory log for the API; nothing is persisted.
#[derive(Default)]
pub struct EventLog {
    events: RwLock<VecDeque<RelayEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub async fn record(&self, kind: EventKind, detail: String) {
        let mut events = self.events.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(RelayEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    /// Newest first.
    pub async fn recent(&self) -> Vec<RelayEvent> {
        self.events.read().await.iter().rev().cloned().collect()
    }
}
