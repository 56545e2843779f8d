// externally visible interfaces
pub mod catalog;
pub mod frame;
pub mod inverter;
pub mod metric_collector;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod response;
pub mod simple_mqtt;
pub mod transport;
