//! Broker side of the relay: connection options, the event loop, and the
//! mapping from MQTT events onto the bridge.

use anyhow::{Context, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::{CommandSink, RelayBridge};
use crate::config::RelayConfig;
use crate::protocol::decode_snapshot;

/// Every Nth consecutive broker error is logged at warn level.
pub const ESCALATE_EVERY: u32 = 3;

/// What the event loop has to do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    /// A new session started; subscriptions do not survive a clean session.
    Subscribe,
}

pub fn options(config: &RelayConfig) -> Result<MqttOptions> {
    let m = &config.mqtt;
    let mut opts = MqttOptions::new(&m.client_id, &m.host, m.port);
    opts.set_keep_alive(Duration::from_secs(m.keep_alive_secs));
    opts.set_clean_session(true);

    if let Some(tls) = &config.tls {
        let read = |path: &std::path::Path| {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
        };
        opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: read(&tls.ca_path)?,
            alpn: None,
            client_auth: Some((read(&tls.cert_path)?, read(&tls.key_path)?)),
        }));
    }
    Ok(opts)
}

/// Apply one incoming event to the bridge.
pub async fn handle_event<S: CommandSink>(
    bridge: &RelayBridge<S>,
    status_topic: &str,
    event: Event,
) -> Followup {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                bridge.record_connectivity(true).await;
                Followup::Subscribe
            } else {
                warn!(code = ?ack.code, "broker refused connection");
                bridge.record_connectivity(false).await;
                bridge.record_error(format!("broker refused connection: {:?}", ack.code)).await;
                Followup::Nothing
            }
        }
        Event::Incoming(Packet::Publish(p)) => {
            if p.topic != status_topic {
                debug!(topic = %p.topic, "ignoring message on unexpected topic");
                return Followup::Nothing;
            }
            match decode_snapshot(&p.payload) {
                Ok(snapshot) => bridge.record_snapshot(snapshot).await,
                Err(e) => {
                    warn!(topic = %p.topic, error = %e, "bad status payload dropped");
                    bridge.record_error(format!("bad status payload: {e}")).await;
                }
            }
            Followup::Nothing
        }
        Event::Incoming(Packet::Disconnect) => {
            info!("broker sent disconnect");
            bridge.record_connectivity(false).await;
            Followup::Nothing
        }
        _ => Followup::Nothing,
    }
}

pub fn escalates(failures: u32) -> bool {
    failures > 0 && failures % ESCALATE_EVERY == 0
}

/// Drive the event loop forever. rumqttc reconnects on the next poll after an
/// error; we only record the outage and pace the retries.
pub async fn run(
    bridge: Arc<RelayBridge<AsyncClient>>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    status_topic: String,
    retry_delay: Duration,
) {
    let mut failures: u32 = 0;
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if handle_event(&bridge, &status_topic, event).await == Followup::Subscribe {
                    failures = 0;
                    match client.try_subscribe(&status_topic, QoS::AtLeastOnce) {
                        Ok(()) => info!(topic = %status_topic, "connected, subscribed to status topic"),
                        Err(e) => warn!(error = %e, "status subscribe failed"),
                    }
                }
            }
            Err(e) => {
                failures += 1;
                if escalates(failures) {
                    warn!(failures, error = %e, "still unable to reach broker");
                } else {
                    debug!(failures, error = %e, "mqtt error, reconnecting");
                }
                bridge.record_connectivity(false).await;
                bridge.record_error(format!("mqtt error: {e}")).await;
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
