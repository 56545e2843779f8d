use crate::response::{Field, FieldValue};
use log::{info, warn};
use std::sync::{Arc, Mutex};

pub trait MetricCollector {
    fn publish(&mut self, field: Field, value: &FieldValue);
}

/// Several fields can share one collector, e.g. a single MQTT connection.
impl<C: MetricCollector> MetricCollector for Arc<Mutex<C>> {
    fn publish(&mut self, field: Field, value: &FieldValue) {
        match self.lock() {
            Ok(mut collector) => collector.publish(field, value),
            Err(_) => warn!("collector poisoned, dropping {field}"),
        }
    }
}

/// Writes every value to the log, for setups without a broker.
#[derive(Default)]
pub struct LogCollector;

impl MetricCollector for LogCollector {
    fn publish(&mut self, field: Field, value: &FieldValue) {
        info!("{field}: {value}");
    }
}

pub type Sink = Box<dyn MetricCollector + Send>;

/// One optional sink per field. Fields without a sink are never published.
pub struct SensorBindings {
    sinks: [Option<Sink>; Field::COUNT],
}

impl Default for SensorBindings {
    fn default() -> Self {
        Self {
            sinks: std::array::from_fn(|_| None),
        }
    }
}

impl SensorBindings {
    pub fn bind(&mut self, field: Field, sink: Sink) -> &mut Self {
        self.sinks[field.index()] = Some(sink);
        self
    }

    /// Binds every listed field to a clone of the shared collector.
    pub fn bind_shared<C>(&mut self, fields: &[Field], collector: &Arc<Mutex<C>>) -> &mut Self
    where
        C: MetricCollector + Send + 'static,
    {
        for &field in fields {
            self.bind(field, Box::new(Arc::clone(collector)));
        }
        self
    }

    pub fn is_bound(&self, field: Field) -> bool {
        self.sinks[field.index()].is_some()
    }

    pub fn bound_fields(&self) -> impl Iterator<Item = Field> + '_ {
        Field::all().filter(|field| self.is_bound(*field))
    }

    pub fn sink_mut(&mut self, field: Field) -> Option<&mut Sink> {
        self.sinks[field.index()].as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::DeviceMode;

    #[derive(Default)]
    struct Recorder {
        published: Vec<(Field, FieldValue)>,
    }

    impl MetricCollector for Recorder {
        fn publish(&mut self, field: Field, value: &FieldValue) {
            self.published.push((field, *value));
        }
    }

    #[test]
    fn unbound_fields_have_no_sink() {
        let mut bindings = SensorBindings::default();
        bindings.bind(Field::GridVoltage, Box::new(LogCollector));

        assert!(bindings.is_bound(Field::GridVoltage));
        assert!(!bindings.is_bound(Field::Mode));
        assert!(bindings.sink_mut(Field::Mode).is_none());
        assert_eq!(bindings.bound_fields().collect::<Vec<_>>(), [Field::GridVoltage]);
    }

    #[test]
    fn shared_collector_sees_all_bound_fields() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let mut bindings = SensorBindings::default();
        bindings.bind_shared(&[Field::Mode, Field::Pv1Power], &recorder);

        if let Some(sink) = bindings.sink_mut(Field::Pv1Power) {
            sink.publish(Field::Pv1Power, &FieldValue::Number(150.0));
        }
        if let Some(sink) = bindings.sink_mut(Field::Mode) {
            sink.publish(Field::Mode, &FieldValue::Mode(DeviceMode::Line));
        }

        let published = &recorder.lock().unwrap().published;
        assert_eq!(
            published,
            &[
                (Field::Pv1Power, FieldValue::Number(150.0)),
                (Field::Mode, FieldValue::Mode(DeviceMode::Line)),
            ]
        );
    }
}
