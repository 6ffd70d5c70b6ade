//! Relay configuration: optional TOML file, environment overrides, and
//! validation that reports every violation at once.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mqtt: MqttSettings,
    /// Mutual TLS towards the broker.
    pub tls: Option<TlsSettings>,
    pub web: WebSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub status_topic: String,
    pub control_topic: String,
    pub keep_alive_secs: u64,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub port: u16,
    /// HTTPS for the API; needs the `tls` feature.
    pub tls: Option<WebTlsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebTlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "plant-relay".into(),
            status_topic: "plant/plant-node/status".into(),
            control_topic: "plant/plant-node/control".into(),
            keep_alive_secs: 30,
            retry_delay_ms: 2000,
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            tls: None,
        }
    }
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt.retry_delay_ms)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v:?}"))?;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        if let Some(v) = lookup("STATUS_TOPIC") {
            self.mqtt.status_topic = v;
        }
        if let Some(v) = lookup("CONTROL_TOPIC") {
            self.mqtt.control_topic = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let m = &self.mqtt;

        for (name, value) in [
            ("mqtt.host", &m.host),
            ("mqtt.client_id", &m.client_id),
            ("mqtt.status_topic", &m.status_topic),
            ("mqtt.control_topic", &m.control_topic),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{name} is empty"));
            }
        }
        if m.status_topic == m.control_topic {
            errors.push("status and control topics must differ".into());
        }
        if m.status_topic.contains(['+', '#']) {
            errors.push(format!(
                "mqtt.status_topic {:?} must name a single device, not a wildcard",
                m.status_topic
            ));
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.keep_alive_secs == 0 {
            errors.push("mqtt.keep_alive_secs must be positive".into());
        }
        if m.retry_delay_ms == 0 {
            errors.push("mqtt.retry_delay_ms must be positive".into());
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

pub fn load(path: Option<&str>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {path}"))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        None => RelayConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate().context("invalid relay config")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
