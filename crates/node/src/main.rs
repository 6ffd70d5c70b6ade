#[cfg(feature = "adc")]
mod adc;
mod clock;
mod config;
mod controller;
mod logging;
mod node;
mod protocol;
mod pump;
mod scheduler;
mod sensor;
mod session;
#[cfg(feature = "sim")]
mod sim;
mod wireless;

use anyhow::{Context, Result};
use tracing::info;

use crate::clock::TokioClock;
use crate::logging::LevelControl;
use crate::node::Node;
use crate::pump::Pump;
use crate::session::MqttTransport;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let log: Box<dyn LevelControl> = Box::new(logging::init());

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = config::load(config_path.as_deref())?;
    info!(
        device_id = %config.device_id,
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        tls = config.tls.is_some(),
        status_topic = %config.status_topic(),
        control_topic = %config.control_topic(),
        "plant node starting"
    );

    let sensor = sensor::open(&config.sensor).context("failed to open moisture sensor")?;
    let pump = Pump::new(config.pump.gpio_pin, config.pump.active_low)
        .context("failed to claim pump GPIO")?;
    let transport = MqttTransport::new(&config);

    let mut node = Node::new(&config, transport, TokioClock, sensor, pump, Some(log));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = node.step() => {}
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "signal handler failed");
                }
                break;
            }
        }
    }

    info!("shutting down, pump off");
    node.shutdown();
    Ok(())
}
