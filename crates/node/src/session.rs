//! Broker session lifecycle.
//!
//! ```text
//!   Offline ──open_link──▶ LinkUp ──open_session + subscribe──▶ SessionUp
//!      ▲                     │                                     │
//!      └──── any failure ────┴──────────── any I/O failure ────────┘
//! ```
//!
//! [`SessionManager`] drives a [`Transport`] through these states and retries
//! forever. Credential and handshake failures are retried like network
//! failures; a field device has nobody to fix it.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport as WireTransport,
};
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{NodeConfig, TlsSettings};

/// Every Nth consecutive failure is logged at warn level.
pub const ESCALATE_EVERY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    LinkUp,
    SessionUp,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("broker unreachable: {0}")]
    Link(String),
    #[error("TLS credentials unavailable: {0}")]
    Credentials(String),
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What `ensure_connected` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    AlreadyUp,
    /// A fresh session was opened; the caller owes the broker a status publish.
    Established,
}

/// The two layers beneath a session: reachability of the broker host, then
/// the (optionally TLS) MQTT session on top of it.
pub trait Transport {
    fn open_link(&mut self) -> impl Future<Output = Result<(), SessionError>>;
    fn open_session(&mut self) -> impl Future<Output = Result<(), SessionError>>;
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
    /// Wait up to `wait` for the next inbound publish. `Ok(None)` on timeout.
    fn next_message(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<InboundMessage>, SessionError>>;
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

pub struct SessionManager<T, C> {
    transport: T,
    clock: C,
    state: SessionState,
    failures: u32,
    control_topic: String,
    retry_delay: Duration,
}

impl<T: Transport, C: Clock> SessionManager<T, C> {
    pub fn new(transport: T, clock: C, control_topic: String, retry_delay: Duration) -> Self {
        Self {
            transport,
            clock,
            state: SessionState::Offline,
            failures: 0,
            control_topic,
            retry_delay,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Return once the session is up, retrying with `retry_delay` between
    /// attempts for as long as it takes.
    ///
    /// `idle` runs before every attempt and again while waiting to retry. It
    /// gets the current time and may return an instant by which it must run
    /// again; an attempt still in flight at that point is abandoned.
    pub async fn ensure_connected(
        &mut self,
        mut idle: impl FnMut(Instant) -> Option<Instant>,
    ) -> Connect {
        if self.state == SessionState::SessionUp {
            return Connect::AlreadyUp;
        }

        loop {
            let wake = idle(self.clock.now());
            match self.attempt_until(wake).await {
                Some(Ok(())) => {
                    info!(
                        topic = %self.control_topic,
                        failed_attempts = self.failures,
                        "session up, subscribed to control topic"
                    );
                    self.failures = 0;
                    return Connect::Established;
                }
                Some(Err(e)) => {
                    self.failures += 1;
                    self.go_offline();
                    if escalates(self.failures) {
                        warn!(failures = self.failures, error = %e, "still unable to reach broker");
                    } else {
                        debug!(failures = self.failures, error = %e, "connect attempt failed");
                    }
                    self.wait_for_retry(&mut idle).await;
                }
                None => {
                    debug!("connect attempt interrupted");
                    self.go_offline();
                }
            }
        }
    }

    /// One connect attempt, abandoned at `wake`. `None` if it was.
    async fn attempt_until(&mut self, wake: Option<Instant>) -> Option<Result<(), SessionError>> {
        let Self {
            transport,
            clock,
            state,
            control_topic,
            ..
        } = self;

        let Some(wake) = wake.filter(|w| *w > clock.now()) else {
            return Some(try_connect(transport, state, control_topic.as_str()).await);
        };
        let pause = wake.saturating_duration_since(clock.now());
        tokio::select! {
            biased;
            res = try_connect(transport, state, control_topic.as_str()) => Some(res),
            _ = clock.sleep(pause) => None,
        }
    }

    async fn wait_for_retry(&mut self, idle: &mut impl FnMut(Instant) -> Option<Instant>) {
        let retry_at = self.clock.now() + self.retry_delay;
        loop {
            let now = self.clock.now();
            if now >= retry_at {
                return;
            }
            let until = match idle(now) {
                Some(wake) if wake > now => wake.min(retry_at),
                _ => retry_at,
            };
            self.clock.sleep(until - now).await;
        }
    }

    /// Fails with `NotConnected`, touching nothing, unless the session is up.
    /// A transport failure drops the session.
    pub fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        if self.state != SessionState::SessionUp {
            return Err(SessionError::NotConnected);
        }
        if let Err(e) = self.transport.publish(topic, payload) {
            warn!(error = %e, "publish failed, dropping session");
            self.go_offline();
            return Err(e);
        }
        Ok(())
    }

    /// Same contract as [`publish`](Self::publish) for the receive side.
    pub async fn next_message(
        &mut self,
        wait: Duration,
    ) -> Result<Option<InboundMessage>, SessionError> {
        if self.state != SessionState::SessionUp {
            return Err(SessionError::NotConnected);
        }
        match self.transport.next_message(wait).await {
            Ok(msg) => Ok(msg),
            Err(e) => {
                warn!(error = %e, "session lost");
                self.go_offline();
                Err(e)
            }
        }
    }

    /// Mark the session dead after a failure seen by the caller.
    pub fn go_offline(&mut self) {
        if self.state != SessionState::Offline {
            self.transport.close();
        }
        self.state = SessionState::Offline;
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// Whether the `failures`-th consecutive failure is logged at warn level.
pub fn escalates(failures: u32) -> bool {
    failures > 0 && failures % ESCALATE_EVERY == 0
}

async fn try_connect<T: Transport>(
    transport: &mut T,
    state: &mut SessionState,
    control_topic: &str,
) -> Result<(), SessionError> {
    if *state == SessionState::Offline {
        transport.open_link().await?;
        *state = SessionState::LinkUp;
        debug!("link up");
    }
    transport.open_session().await?;
    transport.subscribe(control_topic)?;
    *state = SessionState::SessionUp;
    Ok(())
}

// ---------------------------------------------------------------------------
// rumqttc transport
// ---------------------------------------------------------------------------

pub struct MqttTransport {
    host: String,
    port: u16,
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    tls: Option<TlsSettings>,
    conn: Option<(AsyncClient, EventLoop)>,
}

impl MqttTransport {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            host: config.mqtt.host.clone(),
            port: config.mqtt.port,
            client_id: config.client_id(),
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.mqtt.connect_timeout_secs),
            tls: config.tls.clone(),
            conn: None,
        }
    }

    fn options(&self) -> Result<MqttOptions, SessionError> {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);

        // Read on every attempt so a replaced file is picked up without a restart.
        if let Some(tls) = &self.tls {
            let ca = read_pem(&tls.ca_path)?;
            let cert = read_pem(&tls.cert_path)?;
            let key = read_pem(&tls.key_path)?;
            opts.set_transport(WireTransport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
        }
        Ok(opts)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, SessionError> {
    std::fs::read(path).map_err(|e| SessionError::Credentials(format!("{}: {e}", path.display())))
}

impl Transport for MqttTransport {
    async fn open_link(&mut self) -> Result<(), SessionError> {
        let probe = async {
            let addr = lookup_host((self.host.as_str(), self.port))
                .await
                .map_err(|e| SessionError::Link(format!("resolve {}: {e}", self.host)))?
                .next()
                .ok_or_else(|| SessionError::Link(format!("{} has no addresses", self.host)))?;
            TcpStream::connect(addr)
                .await
                .map_err(|e| SessionError::Link(format!("connect {addr}: {e}")))?;
            Ok::<(), SessionError>(())
        };
        timeout(self.connect_timeout, probe)
            .await
            .map_err(|_| SessionError::Link(format!("timed out reaching {}:{}", self.host, self.port)))?
    }

    async fn open_session(&mut self) -> Result<(), SessionError> {
        self.conn = None;
        let opts = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(SessionError::Handshake(format!("{:?}", ack.code)))
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(SessionError::Handshake(e.to_string())),
                }
            }
        };
        timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| SessionError::Handshake("timed out waiting for CONNACK".into()))??;

        self.conn = Some((client, eventloop));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let (client, _) = self.conn.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let (client, _) = self.conn.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn next_message(&mut self, wait: Duration) -> Result<Option<InboundMessage>, SessionError> {
        let (_, eventloop) = self.conn.as_mut().ok_or(SessionError::NotConnected)?;
        let deadline = tokio::time::Instant::now() + wait;

        // The event loop also flushes queued publishes and keep-alives, so it
        // has to be polled even when nothing is expected.
        loop {
            match timeout_at(deadline, eventloop.poll()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Event::Incoming(Packet::Publish(p)))) => {
                    return Ok(Some(InboundMessage {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    }));
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    return Err(SessionError::Transport("broker sent DISCONNECT".into()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(SessionError::Transport(e.to_string())),
            }
        }
    }

    fn close(&mut self) {
        if let Some((client, _)) = self.conn.take() {
            let _ = client.try_disconnect();
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted transport (tests)
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
