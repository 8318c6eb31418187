//! IO modules - external system interfaces
//!
//! - `queue` - bounded raw-event queues, one per producer class
//! - `sources` - sensor and NFC producer adapters
//! - `actuators` - motor command sink
//! - `telemetry` - typed channel from the core to the telemetry worker
//! - `event_log` - part activity log file (JSONL format)
//! - `mqtt_publisher` - MQTT publisher for events, alerts and KPIs
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod actuators;
pub mod event_log;
pub mod mqtt_publisher;
pub mod prometheus;
pub mod queue;
pub mod sources;
pub mod telemetry;

// Re-export commonly used types
pub use actuators::{ActuatorCommand, ActuatorError, ActuatorSink, SimulatedActuators};
pub use event_log::EventLog;
pub use mqtt_publisher::MqttPublisher;
pub use queue::{EnqueueOutcome, EventQueue, QueueSet};
pub use sources::{
    scripted, spawn_sensor_producer, spawn_tag_producer, IdleSource, NfcSource, SensorReading,
    SensorSource, SensorValue,
};
pub use telemetry::{create_telemetry_channel, TelemetryMessage, TelemetrySender};
