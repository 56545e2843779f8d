use crate::{
    metric_collector::MetricCollector,
    mqtt_config::MqttConfig,
    mqtt_wrapper::{MqttWrapper, QoS},
    response::{Field, FieldValue},
};

use log::{debug, warn};

pub const DEFAULT_TOPIC_PREFIX: &str = "pi18";

/// Publishes every value retained on its own topic, `<prefix>/<field>`.
pub struct SimpleMqtt<MQTT: MqttWrapper> {
    client: MQTT,
    topic_prefix: String,
}

impl<MQTT: MqttWrapper> SimpleMqtt<MQTT> {
    pub fn new(config: &MqttConfig) -> Self {
        let mut client = MQTT::new(config, "-sm");
        let topic_prefix = config
            .topic_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        if let Err(e) = client.subscribe(&topic_prefix, QoS::AtMostOnce) {
            warn!("subscription to base topic failed: {e}");
        }
        Self {
            client,
            topic_prefix,
        }
    }

    pub fn topic(&self, field: Field) -> String {
        format!("{}/{}", self.topic_prefix, field.name())
    }

    pub fn client(&self) -> &MQTT {
        &self.client
    }
}

impl<MQTT: MqttWrapper> MetricCollector for SimpleMqtt<MQTT> {
    fn publish(&mut self, field: Field, value: &FieldValue) {
        let topic = self.topic(field);
        let payload = match value {
            FieldValue::Number(number) => format!("{number:.1}"),
            FieldValue::Mode(mode) => mode.to_string(),
        };
        debug!("{topic} = {payload}");

        if let Err(e) = self.client.publish(topic, QoS::AtMostOnce, true, payload) {
            warn!("mqtt error: {e:?}")
        }
    }
}
