//! Typed fire-and-forget channel from the core to the telemetry worker
//!
//! Every call is a `try_send` on a bounded channel: a slow log file or broker
//! can never stall coordination. A full or closed channel drops the message
//! and counts it.

use crate::domain::part::epoch_ms;
use crate::domain::types::{FusedEvent, PartId, UnitId};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages consumed by the telemetry worker
#[derive(Debug, Clone)]
pub enum TelemetryMessage {
    /// Part or unit activity for the event log and KPIs
    Activity(ActivityPayload),
    /// Fused event for live display
    Event(EventPayload),
    /// Alert-level condition
    Alert(AlertPayload),
    /// Single KPI value
    Kpi(KpiPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityPayload {
    pub cell: String,
    /// Epoch ms
    pub ts: u64,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    /// ENTER, PROCESS_START, PUSH_COMPLETE, ...
    pub activity: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub cell: String,
    pub ts: u64,
    pub kind: &'static str,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub cell: String,
    pub ts: u64,
    /// Alert class (part_unidentified, handshake_timeout, invalid_transition, ...)
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KpiPayload {
    pub cell: String,
    pub ts: u64,
    pub name: String,
    pub value: f64,
}

/// Sender handle for telemetry messages
///
/// Clone this to share across controllers and the consumer.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct TelemetrySender {
    tx: mpsc::Sender<TelemetryMessage>,
    cell_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl TelemetrySender {
    pub fn new(tx: mpsc::Sender<TelemetryMessage>, cell_id: String) -> Self {
        Self { tx, cell_id, metrics: None }
    }

    /// Count alerts and dropped messages
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[inline]
    fn send(&self, msg: TelemetryMessage) {
        if self.tx.try_send(msg).is_err() {
            if let Some(ref metrics) = self.metrics {
                metrics.record_telemetry_dropped();
            }
        }
    }

    /// Record a part/unit activity in the event log
    pub fn log_event(&self, part: Option<&PartId>, unit: UnitId, activity: &str) {
        self.send(TelemetryMessage::Activity(ActivityPayload {
            cell: self.cell_id.clone(),
            ts: epoch_ms(),
            unit: unit.to_string(),
            part: part.map(|p| p.to_string()),
            activity: activity.to_string(),
        }));
    }

    /// Publish a fused event for live display
    pub fn publish_event(&self, event: &FusedEvent) {
        self.send(TelemetryMessage::Event(EventPayload {
            cell: self.cell_id.clone(),
            ts: epoch_ms(),
            kind: event.kind.as_str(),
            unit: event.target.to_string(),
            part: event.part_id.as_ref().map(|p| p.to_string()),
        }));
    }

    pub fn publish_alert(
        &self,
        kind: &str,
        unit: Option<UnitId>,
        part: Option<&PartId>,
        detail: impl Into<String>,
    ) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_alert();
        }
        self.send(TelemetryMessage::Alert(AlertPayload {
            cell: self.cell_id.clone(),
            ts: epoch_ms(),
            kind: kind.to_string(),
            unit: unit.map(|u| u.to_string()),
            part: part.map(|p| p.to_string()),
            detail: detail.into(),
        }));
    }

    pub fn publish_kpi(&self, name: &str, value: f64) {
        self.send(TelemetryMessage::Kpi(KpiPayload {
            cell: self.cell_id.clone(),
            ts: epoch_ms(),
            name: name.to_string(),
            value,
        }));
    }
}

/// Create a new telemetry channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_telemetry_channel(
    buffer_size: usize,
    cell_id: String,
) -> (TelemetrySender, mpsc::Receiver<TelemetryMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (TelemetrySender::new(tx, cell_id), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{FusedKind, StationId};
    use std::time::Instant;

    #[test]
    fn test_log_event_payload() {
        let (tx, mut rx) = create_telemetry_channel(4, "lab".to_string());
        tx.log_event(Some(&PartId::new("P42")), UnitId::Station(StationId(1)), "ENTER");

        match rx.try_recv().unwrap() {
            TelemetryMessage::Activity(p) => {
                assert_eq!(p.cell, "lab");
                assert_eq!(p.unit, "S1");
                assert_eq!(p.part.as_deref(), Some("P42"));
                assert_eq!(p.activity, "ENTER");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_publish_event_serializes_kind() {
        let (tx, mut rx) = create_telemetry_channel(4, "lab".to_string());
        let event = FusedEvent::new(
            FusedKind::PartIdentified,
            UnitId::Station(StationId(2)),
            Instant::now(),
        )
        .with_part(PartId::new("abc"));
        tx.publish_event(&event);

        let TelemetryMessage::Event(p) = rx.try_recv().unwrap() else {
            panic!("expected event");
        };
        let json: serde_json::Value = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "part_identified");
        assert_eq!(json["unit"], "S2");
        assert_eq!(json["part"], "abc");
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let (tx, _rx) = create_telemetry_channel(1, "lab".to_string());
        let tx = tx.with_metrics(metrics.clone());

        tx.publish_kpi("wip", 1.0);
        tx.publish_kpi("wip", 2.0);
        tx.publish_kpi("wip", 3.0);

        assert_eq!(metrics.telemetry_dropped_total(), 2);
    }

    #[test]
    fn test_closed_channel_never_fails_caller() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = create_telemetry_channel(4, "lab".to_string());
        drop(rx);
        let tx = tx.with_metrics(metrics.clone());
        tx.publish_alert("handshake_timeout", None, None, "no confirmation");
        assert_eq!(metrics.telemetry_dropped_total(), 1);
    }
}
