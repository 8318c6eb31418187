//! CEP consumer - the single task that drives the coordination core
//!
//! Drains the raw-event queues, fuses, expires on every iteration and
//! delivers each fused event synchronously to its controller. All controller
//! and correlation state is mutated only here.

use crate::domain::types::{as_millis, FusedEvent, RawEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::actuators::ActuatorSink;
use crate::io::queue::QueueSet;
use crate::io::telemetry::TelemetrySender;
use crate::services::cell::Cell;
use crate::services::collision::CollisionManager;
use crate::services::fusion::{FusionEngine, FusionStats};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Final counters reported at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CepStats {
    pub fusion: FusionStats,
    pub delivered: u64,
    pub rejected: u64,
    /// Events left in the queues when the consumer stopped
    pub discarded: u64,
    pub forced_reset: bool,
}

impl CepStats {
    pub fn log(&self) {
        info!(
            consumed = %self.fusion.consumed,
            fused = %self.fusion.fused,
            paired = %self.fusion.paired,
            orphaned = %self.fusion.orphaned,
            ghost = %self.fusion.ghost,
            stalled = %self.fusion.stalled,
            ignored = %self.fusion.ignored,
            fusion_rate = %format!("{:.3}", self.fusion.fusion_rate()),
            delivered = %self.delivered,
            rejected = %self.rejected,
            discarded = %self.discarded,
            forced_reset = %self.forced_reset,
            "cep_final_stats"
        );
    }
}

/// Consumer timing and shutdown settings
#[derive(Debug, Clone, Copy)]
pub struct CepSettings {
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub drain_on_shutdown: bool,
    pub shutdown_grace: Duration,
}

impl CepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            sweep_interval: config.sweep_interval(),
            drain_on_shutdown: config.drain_on_shutdown(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

enum Wake {
    Shutdown,
    Sweep,
    Event(Option<RawEvent>),
}

pub struct CepConsumer {
    queues: QueueSet,
    fusion: FusionEngine,
    cell: Cell,
    collision: Arc<CollisionManager>,
    actuators: Arc<dyn ActuatorSink>,
    telemetry: TelemetrySender,
    metrics: Arc<Metrics>,
    settings: CepSettings,
    delivered: u64,
    rejected: u64,
}

impl CepConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: QueueSet,
        fusion: FusionEngine,
        cell: Cell,
        collision: Arc<CollisionManager>,
        actuators: Arc<dyn ActuatorSink>,
        telemetry: TelemetrySender,
        metrics: Arc<Metrics>,
        settings: CepSettings,
    ) -> Self {
        Self {
            queues,
            fusion,
            cell,
            collision,
            actuators,
            telemetry,
            metrics,
            settings,
            delivered: 0,
            rejected: 0,
        }
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    /// Fuse one raw event and deliver whatever it completes
    pub fn handle_raw(&mut self, raw: RawEvent, now: Instant) {
        self.metrics.record_raw_event(raw.source);
        debug!(
            channel = %raw.channel,
            source = %raw.source.as_str(),
            queued_us = %now.saturating_duration_since(raw.timestamp).as_micros(),
            "raw_event"
        );
        for event in self.fusion.ingest(&raw) {
            self.dispatch(event, now);
        }
    }

    /// Expire stale correlations; runs on every loop iteration
    pub fn expire(&mut self, now: Instant) {
        for event in self.fusion.expire(now) {
            self.dispatch(event, now);
        }
    }

    /// Periodic pass: expiry, corner timeouts and retries, gauges
    pub fn sweep(&mut self, now: Instant) {
        self.expire(now);
        self.cell.tick(now);
        let snapshot = self.collision.snapshot();
        self.metrics.set_corner_gauges(
            snapshot.occupied.len() as u64,
            snapshot.awaiting_handshake.len() as u64,
        );
        self.queues.sample_depths(&self.metrics);
        self.metrics.set_parts_in_progress(self.cell.parts().in_progress());
    }

    /// Deliver to exactly one controller; a rejection is an alert, never fatal
    fn dispatch(&mut self, event: FusedEvent, now: Instant) {
        self.telemetry.publish_event(&event);
        if event.is_alert() {
            self.telemetry.publish_alert(
                event.kind.as_str(),
                Some(event.target),
                event.part_id.as_ref(),
                format!("unmatched correlation at {}", event.target),
            );
        }

        let start = Instant::now();
        let result = self.cell.deliver(&event, now);
        self.metrics.record_delivery(start.elapsed().as_micros() as u64);

        match result {
            Ok(()) => self.delivered += 1,
            Err(rejection) => {
                self.rejected += 1;
                self.metrics.record_rejected();
                warn!(
                    unit = %rejection.unit(),
                    event = %event.kind.as_str(),
                    part_id = ?event.part_id,
                    reason = %rejection,
                    "delivery_rejected"
                );
                self.telemetry.publish_alert(
                    rejection.alert_kind(),
                    Some(rejection.unit()),
                    event.part_id.as_ref(),
                    rejection.to_string(),
                );
            }
        }
    }

    /// Run until shutdown, then perform the shutdown sequence
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> CepStats {
        info!(
            poll_ms = %as_millis(self.settings.poll_interval),
            sweep_ms = %as_millis(self.settings.sweep_interval),
            "cep_consumer_started"
        );

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Wake::Shutdown
                    } else {
                        continue;
                    }
                }
                _ = sweep.tick() => Wake::Sweep,
                event = self.queues.recv_timeout(self.settings.poll_interval) => Wake::Event(event),
            };

            let now = Instant::now();
            match wake {
                Wake::Shutdown => break,
                Wake::Sweep => self.sweep(now),
                Wake::Event(Some(raw)) => {
                    self.handle_raw(raw, now);
                    self.expire(now);
                }
                Wake::Event(None) => self.expire(now),
            }
        }

        self.shutdown().await
    }

    /// Drain or discard, stop every actuator, then reset the collision manager
    pub async fn shutdown(mut self) -> CepStats {
        info!(
            drain = %self.settings.drain_on_shutdown,
            grace_ms = %as_millis(self.settings.shutdown_grace),
            queued = %self.queues.total_len(),
            "cep_shutdown_started"
        );
        self.cell.halt_corners();
        let deadline = Instant::now() + self.settings.shutdown_grace;
        let mut discarded = 0u64;

        if !self.settings.drain_on_shutdown {
            discarded += self.queues.discard_all() as u64;
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.settings.drain_on_shutdown {
                if let Some(raw) = self.queues.try_pop() {
                    self.handle_raw(raw, now);
                    self.expire(now);
                    continue;
                }
            }
            if !self.cell.any_awaiting_handshake() {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
            self.sweep(Instant::now());
        }

        discarded += self.queues.discard_all() as u64;
        if discarded > 0 {
            info!(discarded = %discarded, "cep_events_discarded");
        }

        if let Err(e) = self.actuators.stop_all() {
            error!(error = %e, "fail_safe_stop_failed");
            self.metrics.record_actuator_failure();
        }

        let forced_reset = if self.collision.try_reset() {
            false
        } else {
            let held = self.collision.force_reset();
            warn!(corners = ?held, "collision_force_reset");
            self.telemetry.publish_alert(
                "collision_force_reset",
                None,
                None,
                format!("grace period elapsed with corners {:?} awaiting handshake", held),
            );
            true
        };

        let stats = CepStats {
            fusion: self.fusion.stats(),
            delivered: self.delivered,
            rejected: self.rejected,
            discarded,
            forced_reset,
        };
        stats.log();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CornerId, MotorId, PartId, RawSource, StationId};
    use crate::infra::config::OverflowPolicy;
    use crate::io::actuators::{ActuatorCommand, SimulatedActuators};
    use crate::io::telemetry::create_telemetry_channel;
    use crate::services::station::StationState;

    struct Rig {
        consumer: CepConsumer,
        queues: QueueSet,
        sim: Arc<SimulatedActuators>,
        metrics: Arc<Metrics>,
    }

    fn rig(config: Config) -> Rig {
        let metrics = Arc::new(Metrics::new());
        let topology = Arc::new(config.topology().clone());
        let queues = QueueSet::build(
            &topology,
            config.edge_capacity(),
            config.polled_capacity(),
            config.tag_capacity(),
            OverflowPolicy::DropOldest,
            Some(metrics.clone()),
        );
        let (telemetry, _rx) = create_telemetry_channel(256, "lab".to_string());
        let telemetry = telemetry.with_metrics(metrics.clone());
        let collision = Arc::new(CollisionManager::new(
            topology.corners(),
            config.mutually_exclusive(),
            config.min_reuse_interval(),
        ));
        let sim = Arc::new(SimulatedActuators::new());
        let cell =
            Cell::new(&config, collision.clone(), sim.clone(), telemetry.clone(), metrics.clone());
        let fusion =
            FusionEngine::new(topology, config.identification_window(), config.process_window())
                .with_metrics(metrics.clone());
        let consumer = CepConsumer::new(
            queues.clone(),
            fusion,
            cell,
            collision,
            sim.clone(),
            telemetry,
            metrics.clone(),
            CepSettings::from_config(&config),
        );
        Rig { consumer, queues, sim, metrics }
    }

    #[test]
    fn test_rejection_does_not_stop_consumer() {
        let mut rig = rig(Config::default());
        let t0 = Instant::now();
        // Exit while idle is invalid for the station but fine for corner 4
        rig.consumer.handle_raw(RawEvent::edge(RawSource::Edge, "S1_EXIT", true, t0), t0);
        assert_eq!(rig.metrics.rejected_total(), 1);

        rig.consumer.handle_raw(RawEvent::edge(RawSource::Edge, "S1_ENTRY", true, t0), t0);
        rig.consumer.handle_raw(RawEvent::tag("NFC1", PartId::new("P1"), t0), t0);
        let s1 = rig.consumer.cell().station(StationId(1)).unwrap();
        assert_eq!(s1.state(), StationState::Processing);
    }

    #[tokio::test]
    async fn test_run_consumes_and_shuts_down_safely() {
        let config = Config::default().with_shutdown_grace_ms(200);
        let rig = rig(config);
        let (stop_tx, stop_rx) = watch::channel(false);
        let t0 = Instant::now();
        rig.queues.enqueue(RawEvent::edge(RawSource::Edge, "S2_ENTRY", true, t0));
        rig.queues.enqueue(RawEvent::tag("NFC2", PartId::new("abc"), t0));

        let handle = tokio::spawn(rig.consumer.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.fusion.paired, 1);
        assert_eq!(stats.rejected, 1); // handshake to idle C3
        assert!(!stats.forced_reset);
        assert_eq!(rig.sim.commands().last(), Some(&ActuatorCommand::StopAll));
    }

    #[tokio::test]
    async fn test_shutdown_forces_reset_when_handshake_never_arrives() {
        let config = Config::default().with_shutdown_grace_ms(50);
        let mut rig = rig(config);
        let t0 = Instant::now();
        rig.consumer.handle_raw(RawEvent::edge(RawSource::Edge, "C3_POS", true, t0), t0);
        assert!(rig.consumer.cell().any_awaiting_handshake());

        let stats = rig.consumer.shutdown().await;
        assert!(stats.forced_reset);
        assert_eq!(rig.metrics.alerts_total(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_starts_no_new_push() {
        let config = Config::default()
            .with_shutdown_grace_ms(1000)
            .with_collision_timing_ms(100, 0);
        let mut rig = rig(config);
        let t0 = Instant::now();
        rig.consumer.handle_raw(RawEvent::edge(RawSource::Edge, "C1_POS", true, t0), t0);
        // Exit of S2 is the approach of C2, which shares a path with C1
        rig.consumer.handle_raw(RawEvent::edge(RawSource::Edge, "S2_EXIT", true, t0), t0);
        let c2 = rig.consumer.cell().corner(CornerId(2)).unwrap();
        assert!(c2.status().pending_approach);
        let before = rig.sim.commands().len();

        let stats = rig.consumer.shutdown().await;

        let after = rig.sim.commands().split_off(before);
        // C1 times out and retracts, C2 never extends
        assert!(after.contains(&ActuatorCommand::Retract(MotorId(5))));
        assert!(!after.contains(&ActuatorCommand::Extend(MotorId(6))));
        assert_eq!(after.last(), Some(&ActuatorCommand::StopAll));
        assert!(!stats.forced_reset);
        assert_eq!(rig.metrics.handshake_timeouts_total(), 1);
    }

    #[tokio::test]
    async fn test_discard_mode_counts_leftovers() {
        let config = Config::default().with_shutdown_grace_ms(50).with_drain_on_shutdown(false);
        let rig = rig(config);
        let t0 = Instant::now();
        for _ in 0..3 {
            rig.queues.enqueue(RawEvent::edge(RawSource::Edge, "C1_POS", true, t0));
        }
        let stats = rig.consumer.shutdown().await;
        assert_eq!(stats.discarded, 3);
        assert_eq!(stats.fusion.consumed, 0);
    }
}
