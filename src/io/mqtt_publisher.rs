//! MQTT publisher for telemetry
//!
//! Topics:
//! - events topic - part activities (QoS 1) and live fused events (QoS 0)
//! - alerts topic - alert-level conditions (QoS 1)
//! - kpi topic - KPI values (QoS 0)

use crate::infra::config::Config;
use crate::io::telemetry::TelemetryMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct MqttPublisher {
    client: AsyncClient,
    events_topic: String,
    alerts_topic: String,
    kpi_topic: String,
}

impl MqttPublisher {
    /// Connect to the configured broker; must be called inside a tokio runtime
    pub fn new(config: &Config) -> Self {
        let client_id = format!("{}-telemetry-{}", config.cell_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_telemetry_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_telemetry_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Broker down: keep retrying, the core never waits on us
                        warn!(error = %e, "mqtt_telemetry_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        info!(
            host = %config.mqtt_host(),
            port = %config.mqtt_port(),
            events = %config.mqtt_events_topic(),
            alerts = %config.mqtt_alerts_topic(),
            kpi = %config.mqtt_kpi_topic(),
            "mqtt_telemetry_started"
        );

        Self {
            client,
            events_topic: config.mqtt_events_topic().to_string(),
            alerts_topic: config.mqtt_alerts_topic().to_string(),
            kpi_topic: config.mqtt_kpi_topic().to_string(),
        }
    }

    pub async fn publish(&self, msg: &TelemetryMessage) {
        match msg {
            TelemetryMessage::Activity(payload) => {
                self.send(&self.events_topic, QoS::AtLeastOnce, payload).await
            }
            TelemetryMessage::Event(payload) => {
                self.send(&self.events_topic, QoS::AtMostOnce, payload).await
            }
            TelemetryMessage::Alert(payload) => {
                self.send(&self.alerts_topic, QoS::AtLeastOnce, payload).await
            }
            TelemetryMessage::Kpi(payload) => {
                self.send(&self.kpi_topic, QoS::AtMostOnce, payload).await
            }
        }
    }

    async fn send<T: Serialize>(&self, topic: &str, qos: QoS, payload: &T) {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %topic, error = %e, "mqtt_telemetry_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, qos, false, json.into_bytes()).await {
            debug!(topic = %topic, error = %e, "mqtt_telemetry_publish_failed");
        }
    }
}
