mod bridge;
mod cache;
mod config;
mod events;
mod mqtt;
mod protocol;
mod web;

use anyhow::Result;
use rumqttc::AsyncClient;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bridge::RelayBridge;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let cfg = config::load(config_path.as_deref())?;
    info!(
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        tls = cfg.tls.is_some(),
        status_topic = %cfg.mqtt.status_topic,
        control_topic = %cfg.mqtt.control_topic,
        "plant relay starting"
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let options = mqtt::options(&cfg)?;
    let (client, eventloop) = AsyncClient::new(options, 20);
    let bridge = Arc::new(RelayBridge::new(client.clone(), cfg.mqtt.control_topic.clone()));

    tokio::spawn(mqtt::run(
        Arc::clone(&bridge),
        client,
        eventloop,
        cfg.mqtt.status_topic.clone(),
        cfg.retry_delay(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    if let Err(e) = web::serve(bridge, &cfg.web).await {
        error!(error = %format!("{e:#}"), "web server stopped");
        return Err(e);
    }
    Ok(())
}
