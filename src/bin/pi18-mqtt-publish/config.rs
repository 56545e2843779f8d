use std::{env, fs, path::Path, time::Duration};

use anyhow::Context;
use log::warn;
use pi18::{
    inverter::{
        DriverConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_BACKOFF, DEFAULT_POLL_INTERVAL,
        DEFAULT_READ_TIMEOUT,
    },
    mqtt_config::MqttConfig,
    response::Field,
    transport::DEFAULT_BAUD_RATE,
};
use serde_derive::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub serial_port: String,
    pub baud_rate: Option<u32>,
    /// milliseconds between poll cycles
    pub update_interval: Option<u64>,
    /// milliseconds to wait for an answer
    pub read_timeout: Option<u64>,
    pub failure_threshold: Option<u32>,
    /// milliseconds, upper bound for the backoff pause
    pub max_backoff: Option<u64>,
    /// fields to publish, all of them when absent
    pub sensors: Option<Vec<Field>>,
    pub debug: Option<bool>,
    pub simple_mqtt: Option<MqttConfig>,
}

impl Config {
    pub fn is_valid(&self) -> bool {
        !self.serial_port.is_empty()
            && self.update_interval.map_or(true, |value| value > 0)
            && self.failure_threshold.map_or(true, |value| value > 0)
            && self.simple_mqtt.as_ref().map_or(true, |x| x.is_valid())
    }

    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Could not read {}: {e}", path.display());
                "".into()
            }
        };
        let mut config = Config::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Config> {
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        toml::from_str::<Config>(contents).context("toml config unparsable")
    }

    /// Environment variables take precedence over the file.
    fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // $PI18_SERIAL_PORT
        if let Some(serial_port) = lookup("PI18_SERIAL_PORT") {
            self.serial_port = serial_port;
        }
        // $MQTT_BROKER_HOST
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            self.simple_mqtt.get_or_insert_with(MqttConfig::default).host = host;
        }
        // $MQTT_USERNAME (optional)
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.simple_mqtt
                .get_or_insert_with(MqttConfig::default)
                .username = Some(username);
        }
        // $MQTT_PASSWORD (optional)
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.simple_mqtt
                .get_or_insert_with(MqttConfig::default)
                .password = Some(password);
        }
        // $MQTT_PORT (optional)
        if let Some(port) = lookup("MQTT_PORT") {
            self.simple_mqtt.get_or_insert_with(MqttConfig::default).port =
                Some(port.parse().unwrap_or(1883));
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE)
    }

    pub fn sensors(&self) -> Vec<Field> {
        match &self.sensors {
            Some(sensors) => sensors.clone(),
            None => Field::all().collect(),
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            poll_interval: self
                .update_interval
                .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis),
            read_timeout: self
                .read_timeout
                .map_or(DEFAULT_READ_TIMEOUT, Duration::from_millis),
            failure_threshold: self
                .failure_threshold
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            max_backoff: self
                .max_backoff
                .map_or(DEFAULT_MAX_BACKOFF, Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::parse(r#"serial_port = "/dev/ttyUSB0""#).unwrap();

        assert!(config.is_valid());
        assert_eq!(config.baud_rate(), 2400);
        assert_eq!(config.sensors().len(), Field::COUNT);
        let driver = config.driver_config();
        assert_eq!(driver.poll_interval, Duration::from_secs(5));
        assert_eq!(driver.read_timeout, Duration::from_secs(1));
        assert_eq!(driver.failure_threshold, 3);
    }

    #[test]
    fn full_config() {
        let config = Config::parse(
            r#"
            serial_port = "/dev/ttyS1"
            baud_rate = 9600
            update_interval = 10000
            read_timeout = 800
            failure_threshold = 5
            max_backoff = 30000
            sensors = ["grid_voltage", "pv1_power", "mode"]
            debug = true

            [simple_mqtt]
            host = "broker.local"
            port = 1884
            topic_prefix = "solar/inverter"
            "#,
        )
        .unwrap();

        assert!(config.is_valid());
        assert_eq!(config.baud_rate(), 9600);
        assert_eq!(
            config.sensors(),
            [Field::GridVoltage, Field::Pv1Power, Field::Mode]
        );
        let driver = config.driver_config();
        assert_eq!(driver.poll_interval, Duration::from_secs(10));
        assert_eq!(driver.backoff_interval(), Duration::from_secs(20));
        let mqtt = config.simple_mqtt.unwrap();
        assert_eq!(mqtt.port, Some(1884));
        assert_eq!(mqtt.topic_prefix.as_deref(), Some("solar/inverter"));
    }

    #[test]
    fn unknown_sensor_is_rejected() {
        assert!(Config::parse(
            r#"
            serial_port = "/dev/ttyS1"
            sensors = ["grid_voltage", "pv3_power"]
            "#
        )
        .is_err());
    }

    #[test]
    fn empty_config_is_invalid() {
        let config = Config::parse("").unwrap();
        assert!(!config.is_valid());
    }

    #[test]
    fn environment_overrides() {
        let vars = HashMap::from([
            ("PI18_SERIAL_PORT", "/dev/ttyACM0"),
            ("MQTT_BROKER_HOST", "10.0.0.2"),
            ("MQTT_PORT", "not a port"),
        ]);
        let mut config = Config::parse(r#"serial_port = "/dev/ttyUSB0""#).unwrap();
        config.apply_overrides(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.serial_port, "/dev/ttyACM0");
        let mqtt = config.simple_mqtt.unwrap();
        assert_eq!(mqtt.host, "10.0.0.2");
        assert_eq!(mqtt.port, Some(1883));
        assert_eq!(mqtt.username, None);
    }
}
