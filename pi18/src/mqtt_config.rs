use serde_derive::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub tls: Option<bool>,
    /// Topics are published as `<topic_prefix>/<field>`, defaults to `pi18`.
    pub topic_prefix: Option<String>,
}

impl MqttConfig {
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty()
    }
}
