//! MQTT plumbing: broker endpoint and TLS, detection decoding, the Frigate
//! adapter and the event sink.

pub mod detections;
pub mod frigate;
pub mod mqtt;
mod tls;

pub use detections::{DetectionTopics, DEFAULT_DETECTIONS_SEGMENT};
pub use frigate::{parse_frigate_event, DEFAULT_FRIGATE_TOPIC};
pub use mqtt::{ConnectionStopper, MqttEventSink, MqttPublisher, MqttSettings, MqttSubscriber};
pub use tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};
