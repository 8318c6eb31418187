//! Periodic supervisory view of the cell
//!
//! Runs beside the consumer and only touches state that is safe to read from
//! another task: queue depths, the collision manager and the metrics atomics.
//! New queue overflows since the previous report become one alert per class.

use crate::domain::types::{MotorId, RawSource};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::io::queue::QueueSet;
use crate::io::telemetry::TelemetrySender;
use crate::services::collision::{CollisionManager, CollisionSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// One health observation
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub queue_depth: [u64; 3],
    pub collision: CollisionSnapshot,
    /// Conveyors a corner may stop right now
    pub conveyors_safe_to_stop: Vec<MotorId>,
    pub conveyors_in_use: Vec<MotorId>,
}

pub struct HealthMonitor {
    queues: QueueSet,
    collision: Arc<CollisionManager>,
    metrics: Arc<Metrics>,
    conveyors: Vec<MotorId>,
    interval: Duration,
    telemetry: Option<TelemetrySender>,
    /// Drop counts already alerted on, by `RawSource::index()`
    alerted_drops: [u64; 3],
}

impl HealthMonitor {
    pub fn new(
        queues: QueueSet,
        collision: Arc<CollisionManager>,
        metrics: Arc<Metrics>,
        conveyors: Vec<MotorId>,
        interval: Duration,
    ) -> Self {
        Self {
            queues,
            collision,
            metrics,
            conveyors,
            interval,
            telemetry: None,
            alerted_drops: [0; 3],
        }
    }

    /// Forward queue overflow alerts on the telemetry channel
    pub fn with_telemetry(mut self, telemetry: TelemetrySender) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn check(&self) -> HealthReport {
        let (safe, in_use): (Vec<MotorId>, Vec<MotorId>) = self
            .conveyors
            .iter()
            .copied()
            .partition(|&motor| self.collision.is_conveyor_safe_to_stop(motor));
        HealthReport {
            queue_depth: self.queues.depth_by_source(),
            collision: self.collision.snapshot(),
            conveyors_safe_to_stop: safe,
            conveyors_in_use: in_use,
        }
    }

    /// Take one observation and log it with the metrics summary
    pub fn report(&mut self) -> (HealthReport, MetricsSummary) {
        let health = self.check();
        self.queues.sample_depths(&self.metrics);

        let summary = self.metrics.report(self.metrics.parts_in_progress());
        summary.log();

        info!(
            edge_depth = %health.queue_depth[0],
            polled_depth = %health.queue_depth[1],
            tag_depth = %health.queue_depth[2],
            occupied = ?health.collision.occupied,
            awaiting_handshake = ?health.collision.awaiting_handshake,
            conveyors_in_use = ?health.conveyors_in_use,
            "cell_health"
        );
        if summary.dropped_total() > 0 {
            warn!(dropped = %summary.dropped_total(), "raw_events_dropped");
        }
        self.alert_new_drops(&summary);
        (health, summary)
    }

    fn alert_new_drops(&mut self, summary: &MetricsSummary) {
        for source in RawSource::ALL {
            let i = source.index();
            let total = summary.dropped_by_source[i];
            let new = total.saturating_sub(self.alerted_drops[i]);
            if new == 0 {
                continue;
            }
            self.alerted_drops[i] = total;
            if let Some(ref telemetry) = self.telemetry {
                telemetry.publish_alert(
                    "queue_overflow",
                    None,
                    None,
                    format!("{} queue dropped {} events ({} total)", source.as_str(), new, total),
                );
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.report();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("health_monitor_stopped");
    }
}
