//! Node configuration: optional TOML file, environment overrides, then
//! validation that reports every problem at once.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::{ControllerSettings, CHANGE_THRESHOLD_RANGE, THRESHOLD_RANGE};
use crate::sensor::Calibration;

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i32 = 32767;

/// BCM pins usable on the 40-pin header. 0-1 belong to the ID EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device_id: String,
    pub mqtt: MqttSettings,
    pub tls: Option<TlsSettings>,
    pub control: ControlSettings,
    pub sensor: SensorSettings,
    pub pump: PumpSettings,
    pub wireless: WirelessSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub status_topic: Option<String>,
    pub control_topic: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry_delay_ms: u64,
}

/// PEM files for mutual TLS with the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub tick_ms: u64,
    pub publish_interval_secs: u64,
    pub max_pump_runtime_secs: u64,
    pub moisture_threshold: i64,
    pub change_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub raw_dry: i32,
    pub raw_wet: i32,
    pub adc_address: u16,
    pub adc_channel: u8,
    pub sim_scenario: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub gpio_pin: u8,
    pub active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WirelessSettings {
    pub interface: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: "plant-node".into(),
            mqtt: MqttSettings::default(),
            tls: None,
            control: ControlSettings::default(),
            sensor: SensorSettings::default(),
            pump: PumpSettings::default(),
            wireless: WirelessSettings::default(),
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: None,
            status_topic: None,
            control_topic: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            retry_delay_ms: 2000,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            publish_interval_secs: 60,
            max_pump_runtime_secs: 30,
            moisture_threshold: 30,
            change_threshold: 5,
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            raw_dry: 26000,
            raw_wet: 12000,
            adc_address: 0x48,
            adc_channel: 0,
            sim_scenario: "drying".into(),
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            gpio_pin: 17,
            active_low: true,
        }
    }
}

impl Default for WirelessSettings {
    fn default() -> Self {
        Self {
            interface: "wlan0".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl NodeConfig {
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("plant-node-{}", self.device_id))
    }

    pub fn status_topic(&self) -> String {
        self.mqtt
            .status_topic
            .clone()
            .unwrap_or_else(|| format!("plant/{}/status", self.device_id))
    }

    pub fn control_topic(&self) -> String {
        self.mqtt
            .control_topic
            .clone()
            .unwrap_or_else(|| format!("plant/{}/control", self.device_id))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.control.tick_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.control.publish_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt.retry_delay_ms)
    }

    /// Only meaningful after `validate` has passed.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            moisture_threshold: self.control.moisture_threshold.clamp(0, 100) as u8,
            change_threshold: self.control.change_threshold.clamp(1, 20) as u8,
            max_pump_runtime: Duration::from_secs(self.control.max_pump_runtime_secs),
        }
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            raw_dry: self.sensor.raw_dry,
            raw_wet: self.sensor.raw_wet,
        }
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply overrides from `lookup` (normally `std::env::var`). Unparseable
    /// numeric values are reported rather than silently dropped.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v:?}"))?;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(v);
        }
        if let Some(v) = lookup("STATUS_TOPIC") {
            self.mqtt.status_topic = Some(v);
        }
        if let Some(v) = lookup("CONTROL_TOPIC") {
            self.mqtt.control_topic = Some(v);
        }
        if let Some(v) = lookup("TICK_MS") {
            self.control.tick_ms = v
                .parse()
                .with_context(|| format!("TICK_MS is not a number: {v:?}"))?;
        }
        if let Some(v) = lookup("SIM_SCENARIO") {
            self.sensor.sim_scenario = v;
        }
        if let Some(v) = lookup("PUMP_ACTIVE_LOW") {
            self.pump.active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".into());
        }
        self.validate_mqtt(&mut errors);
        self.validate_control(&mut errors);
        self.validate_hardware(&mut errors);

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

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        for (name, value) in [
            ("mqtt.client_id", &self.mqtt.client_id),
            ("mqtt.status_topic", &self.mqtt.status_topic),
            ("mqtt.control_topic", &self.mqtt.control_topic),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                errors.push(format!("{name} is empty"));
            }
        }
        if self.status_topic() == self.control_topic() {
            errors.push("status and control topics must differ".into());
        }
        if self.mqtt.keep_alive_secs == 0 {
            errors.push("mqtt.keep_alive_secs must be positive".into());
        }
        if self.mqtt.connect_timeout_secs == 0 {
            errors.push("mqtt.connect_timeout_secs must be positive".into());
        }
        if self.mqtt.retry_delay_ms == 0 {
            errors.push("mqtt.retry_delay_ms must be positive".into());
        }
        if let Some(tls) = &self.tls {
            for (name, path) in [
                ("tls.ca_path", &tls.ca_path),
                ("tls.cert_path", &tls.cert_path),
                ("tls.key_path", &tls.key_path),
            ] {
                if path.as_os_str().is_empty() {
                    errors.push(format!("{name} is empty"));
                }
            }
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if c.tick_ms == 0 {
            errors.push("control.tick_ms must be positive".into());
        }
        if c.publish_interval_secs == 0 {
            errors.push("control.publish_interval_secs must be positive".into());
        }
        if c.max_pump_runtime_secs == 0 {
            errors.push("control.max_pump_runtime_secs must be positive".into());
        }
        if !THRESHOLD_RANGE.contains(&c.moisture_threshold) {
            errors.push(format!(
                "control.moisture_threshold {} out of range [0, 100]",
                c.moisture_threshold
            ));
        }
        if !CHANGE_THRESHOLD_RANGE.contains(&c.change_threshold) {
            errors.push(format!(
                "control.change_threshold {} out of range [1, 20]",
                c.change_threshold
            ));
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        if !(0..=ADS1115_MAX).contains(&s.raw_dry) {
            errors.push(format!(
                "sensor.raw_dry {} out of ADS1115 range [0, {ADS1115_MAX}]",
                s.raw_dry
            ));
        }
        if !(0..=ADS1115_MAX).contains(&s.raw_wet) {
            errors.push(format!(
                "sensor.raw_wet {} out of ADS1115 range [0, {ADS1115_MAX}]",
                s.raw_wet
            ));
        }
        if s.raw_dry == s.raw_wet {
            errors.push(format!(
                "sensor.raw_dry and sensor.raw_wet are both {}, calibration range is zero",
                s.raw_dry
            ));
        }
        if s.adc_channel > 3 {
            errors.push(format!("sensor.adc_channel {} out of range [0, 3]", s.adc_channel));
        }
        if !VALID_GPIO_PINS.contains(&self.pump.gpio_pin) {
            errors.push(format!(
                "pump.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.pump.gpio_pin
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse `path` if given (defaults otherwise), apply environment overrides
/// and validate.
pub fn load(path: Option<&str>) -> Result<NodeConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {path}"))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        None => NodeConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate().context("invalid node config")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn assert_validation_err(cfg: &NodeConfig, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains(needle), "expected error containing {needle:?}, got: {msg}");
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn defaults_are_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.device_id, "plant-node");
        assert_eq!(cfg.mqtt.port, 1883);
        assert!(cfg.tls.is_none());
        assert_eq!(cfg.control.max_pump_runtime_secs, 30);
    }

    #[test]
    fn parse_full_config() {
        let cfg: NodeConfig = toml::from_str(
            r#"
device_id = "basil"

[mqtt]
host = "broker.example.com"
port = 8883
status_topic = "plant/basil/status"
control_topic = "plant/basil/control"

[tls]
ca_path = "/etc/plant/ca.pem"
cert_path = "/etc/plant/device.crt"
key_path = "/etc/plant/device.key"

[control]
tick_ms = 500
moisture_threshold = 40
change_threshold = 3

[sensor]
raw_dry = 25000
raw_wet = 11000
adc_channel = 2

[pump]
gpio_pin = 27
active_low = false
"#,
        )
        .unwrap();

        cfg.validate().unwrap();
        assert_eq!(cfg.mqtt.host, "broker.example.com");
        assert_eq!(cfg.tls.as_ref().unwrap().key_path, PathBuf::from("/etc/plant/device.key"));
        assert_eq!(cfg.tick(), Duration::from_millis(500));
        assert_eq!(cfg.controller_settings().moisture_threshold, 40);
        assert_eq!(cfg.sensor.adc_channel, 2);
        assert!(!cfg.pump.active_low);
        // Unset keys keep defaults.
        assert_eq!(cfg.control.publish_interval_secs, 60);
        assert_eq!(cfg.wireless.interface, "wlan0");
    }

    #[test]
    fn partial_tls_section_fails_to_parse() {
        let res: Result<NodeConfig, _> = toml::from_str(
            r#"
[tls]
ca_path = "/etc/plant/ca.pem"
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn topics_and_client_id_derive_from_device_id() {
        let cfg = NodeConfig {
            device_id: "fern".into(),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.status_topic(), "plant/fern/status");
        assert_eq!(cfg.control_topic(), "plant/fern/control");
        assert_eq!(cfg.client_id(), "plant-node-fern");
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = NodeConfig::default();
        cfg.apply_env(env(&[
            ("DEVICE_ID", "mint"),
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "8883"),
            ("CONTROL_TOPIC", "garden/mint/cmd"),
            ("PUMP_ACTIVE_LOW", "false"),
        ]))
        .unwrap();

        assert_eq!(cfg.device_id, "mint");
        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.control_topic(), "garden/mint/cmd");
        assert_eq!(cfg.status_topic(), "plant/mint/status");
        assert!(!cfg.pump.active_low);
    }

    #[test]
    fn env_bad_port_is_an_error() {
        let mut cfg = NodeConfig::default();
        assert!(cfg.apply_env(env(&[("MQTT_PORT", "eighty")])).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.control.moisture_threshold = 150;
        assert_validation_err(&cfg, "moisture_threshold 150");
    }

    #[test]
    fn change_threshold_zero_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.control.change_threshold = 0;
        assert_validation_err(&cfg, "change_threshold 0");
    }

    #[test]
    fn zero_durations_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.control.tick_ms = 0;
        cfg.control.max_pump_runtime_secs = 0;
        assert_validation_err(&cfg, "tick_ms must be positive");
        assert_validation_err(&cfg, "max_pump_runtime_secs must be positive");
    }

    #[test]
    fn same_topics_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.mqtt.status_topic = Some("plant/x".into());
        cfg.mqtt.control_topic = Some("plant/x".into());
        assert_validation_err(&cfg, "topics must differ");
    }

    #[test]
    fn empty_topic_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.mqtt.control_topic = Some(" ".into());
        assert_validation_err(&cfg, "mqtt.control_topic is empty");
    }

    #[test]
    fn calibration_checks() {
        let mut cfg = NodeConfig::default();
        cfg.sensor.raw_dry = 40000;
        assert_validation_err(&cfg, "raw_dry 40000 out of ADS1115 range");

        let mut cfg = NodeConfig::default();
        cfg.sensor.raw_dry = 15000;
        cfg.sensor.raw_wet = 15000;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn gpio_and_channel_checks() {
        let mut cfg = NodeConfig::default();
        cfg.pump.gpio_pin = 1;
        cfg.sensor.adc_channel = 4;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
        assert_validation_err(&cfg, "adc_channel 4");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = NodeConfig::default();
        cfg.device_id = "".into();
        cfg.mqtt.host = "".into();
        cfg.control.moisture_threshold = -1;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("device_id is empty"), "{msg}");
        assert!(msg.contains("mqtt.host is empty"), "{msg}");
        assert!(msg.contains("moisture_threshold -1"), "{msg}");
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = load(None).unwrap();
        assert!(cfg.validate().is_ok());
    }
}
