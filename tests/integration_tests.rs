use pi18::{
    frame,
    inverter::{DriverConfig, Inverter, SharedInverter, TickOutcome},
    metric_collector::{MetricCollector, SensorBindings},
    mqtt_config::MqttConfig,
    mqtt_wrapper::{MqttWrapper, QoS},
    response::{DeviceMode, Field, FieldValue},
    simple_mqtt::SimpleMqtt,
    transport::{Transport, TransportError},
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const STATUS: &[u8] = b"2300,500,2301,499,0460,0380,007,538,000,000,000,012,085,035,030,031,0150,0000,3600,0000,0,2,0,1,1,2,0,0";

struct MqttTester {
    subscriptions: Vec<String>,
    published_values: Vec<(String, Vec<u8>)>,
}

impl MqttTester {
    pub fn len(&self) -> usize {
        self.published_values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payload(&self, topic: &str) -> Option<String> {
        self.published_values
            .iter()
            .rev()
            .find(|(published, _)| published == topic)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
    }
}

impl MqttWrapper for MqttTester {
    fn subscribe(&mut self, topic: &str, _qos: QoS) -> anyhow::Result<()> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish<S, V>(&mut self, topic: S, _qos: QoS, _retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.published_values.push((topic.into(), payload.into()));
        Ok(())
    }

    fn new(_config: &MqttConfig, _suffix: &str) -> Self {
        Self {
            subscriptions: Vec::new(),
            published_values: Vec::new(),
        }
    }
}

fn mqtt_config(topic_prefix: Option<&str>) -> MqttConfig {
    MqttConfig {
        host: "frob".to_owned(),
        port: Some(1234),
        username: None,
        password: None,
        tls: None,
        client_id: Some("myclient".to_string()),
        topic_prefix: topic_prefix.map(str::to_string),
    }
}

/// Replies to each write with the next canned answer, split into chunks.
struct CannedTransport {
    answers: VecDeque<Vec<Vec<u8>>>,
    pending: VecDeque<Vec<u8>>,
}

impl CannedTransport {
    fn new(payloads: &[&[u8]]) -> Self {
        let answers: VecDeque<Vec<Vec<u8>>> = payloads
            .iter()
            .map(|payload| {
                let wire = frame::encode_response(payload).unwrap();
                wire.chunks(7).map(<[u8]>::to_vec).collect()
            })
            .collect();
        Self {
            answers,
            pending: VecDeque::new(),
        }
    }
}

impl Transport for CannedTransport {
    fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        self.pending = self.answers.pop_front().unwrap_or_default().into();
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        _max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.pending
            .pop_front()
            .ok_or(TransportError::Timeout(timeout))
    }
}

#[test]
fn publish_one_message() {
    let mut mqtt = MqttTester::new(&mqtt_config(None), "-test");
    let result = mqtt.publish("foo", QoS::AtMostOnce, true, "Hooray".to_string());
    assert!(result.is_ok());
    assert!(!mqtt.is_empty());
    assert_eq!(mqtt.len(), 1);
}

#[test]
fn simple_mqtt_topics() {
    let mut simple = SimpleMqtt::<MqttTester>::new(&mqtt_config(None));
    simple.publish(Field::GridVoltage, &FieldValue::Number(230.0));
    simple.publish(Field::Mode, &FieldValue::Mode(DeviceMode::Battery));

    let client = simple.client();
    assert_eq!(client.subscriptions, ["pi18"]);
    assert_eq!(client.len(), 2);
    assert_eq!(client.payload("pi18/grid_voltage").as_deref(), Some("230.0"));
    assert_eq!(client.payload("pi18/mode").as_deref(), Some("Battery"));
}

#[test]
fn simple_mqtt_custom_prefix() {
    let simple = SimpleMqtt::<MqttTester>::new(&mqtt_config(Some("solar/pi18")));
    assert_eq!(simple.topic(Field::Pv1Power), "solar/pi18/pv1_power");
}

#[test]
fn inverter_to_mqtt() {
    let simple = Arc::new(Mutex::new(SimpleMqtt::<MqttTester>::new(&mqtt_config(None))));
    let mut bindings = SensorBindings::default();
    bindings.bind_shared(
        &[Field::Mode, Field::GridVoltage, Field::BatteryVoltage, Field::Pv1Power],
        &simple,
    );
    let mut inverter = Inverter::new(
        CannedTransport::new(&[b"03", STATUS]),
        DriverConfig::default(),
        bindings,
    );

    let t0 = Instant::now();
    assert!(matches!(
        inverter.tick(t0),
        TickOutcome::Published { fields: 1, .. }
    ));
    assert!(matches!(
        inverter.tick(t0 + Duration::from_secs(5)),
        TickOutcome::Published { fields: 3, .. }
    ));

    let simple = simple.lock().unwrap();
    let client = simple.client();
    assert_eq!(client.len(), 4);
    assert_eq!(client.payload("pi18/mode").as_deref(), Some("Battery"));
    assert_eq!(client.payload("pi18/grid_voltage").as_deref(), Some("230.0"));
    assert_eq!(client.payload("pi18/battery_voltage").as_deref(), Some("53.8"));
    assert_eq!(client.payload("pi18/pv1_power").as_deref(), Some("150.0"));
    assert_eq!(client.payload("pi18/grid_frequency"), None);
}

/// Every exchange takes a while; counts how many are in flight at once.
struct SlowTransport {
    answer: Vec<u8>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Transport for SlowTransport {
    fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        _max_bytes: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        thread::sleep(Duration::from_millis(30));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

#[derive(Default)]
struct Counter(usize);

impl MetricCollector for Counter {
    fn publish(&mut self, _field: Field, _value: &FieldValue) {
        self.0 += 1;
    }
}

#[test]
fn ticks_faster_than_cycles_never_overlap() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let transport = SlowTransport {
        answer: frame::encode_response(b"05").unwrap(),
        in_flight: Arc::clone(&in_flight),
        max_in_flight: Arc::clone(&max_in_flight),
    };
    let counter = Arc::new(Mutex::new(Counter::default()));
    let mut bindings = SensorBindings::default();
    bindings.bind_shared(&[Field::Mode], &counter);
    let shared = SharedInverter::new(Inverter::new(
        transport,
        DriverConfig {
            read_timeout: Duration::from_millis(500),
            ..DriverConfig::default()
        },
        bindings,
    ));

    let tickers: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut outcomes = Vec::new();
                for _ in 0..20 {
                    outcomes.push(shared.try_tick(Instant::now()));
                    thread::sleep(Duration::from_millis(5));
                }
                outcomes
            })
        })
        .collect();
    let outcomes: Vec<TickOutcome> = tickers
        .into_iter()
        .flat_map(|ticker| ticker.join().unwrap())
        .collect();

    let published = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, TickOutcome::Published { .. }))
        .count();
    let dropped = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, TickOutcome::Dropped))
        .count();

    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    assert!(published > 0);
    assert!(dropped > 0);
    assert_eq!(published + dropped, 80);
    assert_eq!(counter.lock().unwrap().0, published);
    assert_eq!(shared.with(|inverter| inverter.consecutive_failures()), 0);
}
