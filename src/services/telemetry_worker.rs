//! Telemetry worker - the single consumer of the telemetry channel
//!
//! Appends activities and alerts to the event log, feeds the KPI tracker,
//! forwards everything to MQTT when enabled and periodically publishes KPI
//! snapshots. All disk and network I/O of the process happens here.

use crate::io::event_log::EventLog;
use crate::io::mqtt_publisher::MqttPublisher;
use crate::io::telemetry::{KpiPayload, TelemetryMessage};
use crate::services::kpi::{KpiSnapshot, KpiTracker};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct TelemetryWorker {
    rx: mpsc::Receiver<TelemetryMessage>,
    cell_id: String,
    event_log: EventLog,
    kpi: KpiTracker,
    mqtt: Option<MqttPublisher>,
    kpi_interval: Duration,
    drain_timeout: Duration,
    written: u64,
    write_failures: u64,
}

impl TelemetryWorker {
    pub fn new(
        rx: mpsc::Receiver<TelemetryMessage>,
        cell_id: &str,
        event_log: EventLog,
        kpi_interval: Duration,
    ) -> Self {
        Self {
            rx,
            cell_id: cell_id.to_string(),
            event_log,
            kpi: KpiTracker::new(Instant::now()),
            mqtt: None,
            kpi_interval,
            drain_timeout: Duration::from_millis(500),
            written: 0,
            write_failures: 0,
        }
    }

    pub fn with_mqtt(mut self, mqtt: MqttPublisher) -> Self {
        self.mqtt = Some(mqtt);
        self
    }

    /// Upper bound on the post-shutdown drain; it ends early once every sender is dropped
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub async fn handle(&mut self, msg: TelemetryMessage) {
        match &msg {
            TelemetryMessage::Activity(activity) => {
                self.kpi.record(
                    &activity.unit,
                    activity.part.as_deref(),
                    &activity.activity,
                    Instant::now(),
                );
                self.count_write(self.event_log.write_activity(activity));
            }
            TelemetryMessage::Alert(alert) => {
                self.count_write(self.event_log.write_alert(alert));
            }
            TelemetryMessage::Event(_) | TelemetryMessage::Kpi(_) => {}
        }
        if let Some(ref mqtt) = self.mqtt {
            mqtt.publish(&msg).await;
        }
    }

    fn count_write(&mut self, ok: bool) {
        if ok {
            self.written += 1;
        } else {
            self.write_failures += 1;
        }
    }

    pub fn kpi_snapshot(&self) -> KpiSnapshot {
        self.kpi.snapshot(Instant::now())
    }

    async fn publish_kpis(&self) {
        let snapshot = self.kpi_snapshot();
        debug!(
            total_parts = %snapshot.total_parts,
            current_wip = %snapshot.current_wip,
            throughput_per_hour = %format!("{:.1}", snapshot.throughput_per_hour),
            "kpi_snapshot"
        );
        let Some(ref mqtt) = self.mqtt else {
            return;
        };
        let ts = crate::domain::part::epoch_ms();
        for (name, value) in snapshot.as_pairs() {
            let msg = TelemetryMessage::Kpi(KpiPayload { cell: self.cell_id.clone(), ts, name, value });
            mqtt.publish(&msg).await;
        }
    }

    /// Run until shutdown, then drain whatever is already queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            run_id = %self.event_log.run_id(),
            mqtt = %self.mqtt.is_some(),
            kpi_interval_secs = %self.kpi_interval.as_secs(),
            "telemetry_worker_started"
        );

        let mut kpi_tick = tokio::time::interval(self.kpi_interval.max(Duration::from_millis(100)));
        kpi_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = kpi_tick.tick() => {
                    self.publish_kpis().await;
                }
            }
        }

        // The consumer keeps sending during its shutdown sequence
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            self.handle(msg).await;
        }
        self.publish_kpis().await;

        info!(
            written = %self.written,
            write_failures = %self.write_failures,
            "telemetry_worker_stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{PartId, StationId, UnitId};
    use crate::io::telemetry::create_telemetry_channel;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_writes_activities_and_alerts_and_updates_kpis() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let (tx, rx) = create_telemetry_channel(16, "lab".to_string());
        let log = EventLog::new(path.to_str().unwrap(), "run-t");
        let mut worker = TelemetryWorker::new(rx, "lab", log, Duration::from_secs(5));

        let part = PartId::new("P42");
        let s1 = UnitId::Station(StationId(1));
        tx.log_event(Some(&part), s1, "ENTER");
        tx.log_event(Some(&part), s1, "EXIT");
        tx.publish_alert("part_unidentified", Some(s1), None, "entry without tag");
        drop(tx);

        while let Some(msg) = worker.rx.recv().await {
            worker.handle(msg).await;
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("ALERT_PART_UNIDENTIFIED"));

        let snap = worker.kpi_snapshot();
        assert_eq!(snap.total_parts, 1);
        assert_eq!(snap.stations[0].completed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let (tx, rx) = create_telemetry_channel(16, "lab".to_string());
        let log = EventLog::new(path.to_str().unwrap(), "run-t");
        let worker = TelemetryWorker::new(rx, "lab", log, Duration::from_secs(5));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(worker.run(stop_rx));
        tx.log_event(None, UnitId::Station(StationId(2)), "ENTER");
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(fs::read_to_string(&path).unwrap().contains("\"unit\":\"S2\""));
    }
}
