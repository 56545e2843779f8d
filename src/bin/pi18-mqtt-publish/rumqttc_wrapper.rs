use std::thread;
use std::time::Duration;

use log::warn;
use pi18::{
    mqtt_config::MqttConfig,
    mqtt_wrapper::{self},
};
use rumqttc::{
    tokio_rustls::{self, rustls::ClientConfig},
    Client, MqttOptions, Transport,
};

pub struct RumqttcWrapper {
    client: Client,
}

fn match_qos(qos: mqtt_wrapper::QoS) -> rumqttc::QoS {
    match qos {
        mqtt_wrapper::QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        mqtt_wrapper::QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        mqtt_wrapper::QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn native_roots() -> tokio_rustls::rustls::RootCertStore {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in native.errors {
        warn!("could not load platform certificate: {e}");
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!("rejected platform certificate: {e}");
        }
    }
    roots
}

impl mqtt_wrapper::MqttWrapper for RumqttcWrapper {
    fn subscribe(&mut self, topic: &str, qos: mqtt_wrapper::QoS) -> anyhow::Result<()> {
        Ok(self.client.try_subscribe(topic, match_qos(qos))?)
    }

    // try_publish only enqueues, the poll cycle never waits on the broker
    fn publish<S, V>(
        &mut self,
        topic: S,
        qos: mqtt_wrapper::QoS,
        retain: bool,
        payload: V,
    ) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        Ok(self
            .client
            .try_publish(topic, match_qos(qos), retain, payload)?)
    }

    fn new(config: &MqttConfig, suffix: &str) -> Self {
        let use_tls = config.tls.is_some_and(|tls| tls);
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| "pi18-mqtt-publisher".to_string());

        let mut mqttoptions = MqttOptions::new(
            client_id + suffix,
            &config.host,
            config.port.unwrap_or(if use_tls { 8883 } else { 1883 }),
        );
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if use_tls {
            let client_config = ClientConfig::builder()
                .with_root_certificates(native_roots())
                .with_no_client_auth();

            mqttoptions.set_transport(Transport::tls_with_config(client_config.into()));
        }

        //parse the mqtt authentication options
        if let Some((username, password)) = match (&config.username, &config.password) {
            (None, _) => None,
            (Some(username), None) => Some((username.clone(), "".into())),
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
        } {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut connection) = Client::new(mqttoptions, 512);

        thread::spawn(move || {
            // keep polling the event loop to make sure outgoing messages get sent.
            // The iterator yields connection errors too and retries internally,
            // it ends once the client is dropped.
            for notification in connection.iter() {
                if let Err(e) = notification {
                    warn!("mqtt connection: {e}");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        });
        Self { client }
    }
}
