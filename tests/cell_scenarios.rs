//! End-to-end scenarios: raw events in, controller state and actuator commands out

use cell_coordinator::domain::{
    CornerId, FusedEvent, FusedKind, MotorId, PartActivity, PartId, RawEvent, RawSource,
    StationId, UnitId,
};
use cell_coordinator::infra::{Config, Metrics, OverflowPolicy};
use cell_coordinator::io::{
    create_telemetry_channel, ActuatorCommand, EnqueueOutcome, QueueSet, SimulatedActuators,
    TelemetryMessage,
};
use cell_coordinator::services::{
    Cell, CepConsumer, CepSettings, CollisionManager, CornerState, FusionEngine, Rejection,
    StationState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

struct Rig {
    consumer: CepConsumer,
    collision: Arc<CollisionManager>,
    sim: Arc<SimulatedActuators>,
    metrics: Arc<Metrics>,
    telemetry_rx: mpsc::Receiver<TelemetryMessage>,
}

impl Rig {
    fn new(config: Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        let topology = Arc::new(config.topology().clone());
        let queues = QueueSet::from_config(&config, metrics.clone());
        let (telemetry, telemetry_rx) = create_telemetry_channel(1024, "lab".to_string());
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
            queues,
            fusion,
            cell,
            collision.clone(),
            sim.clone(),
            telemetry,
            metrics.clone(),
            CepSettings::from_config(&config),
        );
        Self { consumer, collision, sim, metrics, telemetry_rx }
    }

    fn edge(&mut self, channel: &str, level: bool, at: Instant) {
        self.consumer.handle_raw(RawEvent::edge(RawSource::Edge, channel, level, at), at);
    }

    fn tag(&mut self, reader: &str, part: &str, at: Instant) {
        self.consumer.handle_raw(RawEvent::tag(reader, PartId::new(part), at), at);
    }

    fn station(&self, id: u8) -> StationState {
        self.consumer.cell().station(StationId(id)).unwrap().state()
    }

    fn corner(&self, id: u8) -> CornerState {
        self.consumer.cell().corner(CornerId(id)).unwrap().state()
    }

    fn alert_kinds(&mut self) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(msg) = self.telemetry_rx.try_recv() {
            if let TelemetryMessage::Alert(alert) = msg {
                kinds.push(alert.kind);
            }
        }
        kinds
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_part_p42_full_station_cycle() {
    let mut rig = Rig::new(Config::default().with_identification_window_ms(500));
    let t0 = Instant::now();

    rig.edge("S1_ENTRY", true, t0);
    assert_eq!(rig.station(1), StationState::Entering);

    rig.tag("NFC1", "P42", t0 + ms(120));
    assert_eq!(rig.station(1), StationState::Processing);
    assert_eq!(rig.consumer.fusion().stats().paired, 1);

    rig.edge("S1_PROCESS", true, t0 + ms(1000));
    rig.edge("S1_PROCESS", false, t0 + ms(3000));
    assert_eq!(rig.station(1), StationState::Exiting);

    rig.edge("S1_EXIT", true, t0 + ms(4000));
    assert_eq!(rig.station(1), StationState::Idle);
    // Exit of S1 is the approach of C4, which is free
    assert!(matches!(rig.corner(4), CornerState::WaitingForConfirmation { .. }));

    let part = rig.consumer.cell().parts().get(&PartId::new("P42")).unwrap();
    let activities: Vec<PartActivity> = part
        .history
        .iter()
        .filter(|r| r.unit == UnitId::Station(StationId(1)))
        .map(|r| r.activity)
        .collect();
    assert_eq!(
        activities,
        vec![
            PartActivity::Enter,
            PartActivity::ProcessStart,
            PartActivity::ProcessEnd,
            PartActivity::Exit
        ]
    );

    let drive: Vec<ActuatorCommand> = rig
        .sim
        .commands()
        .into_iter()
        .filter(|c| {
            matches!(c, ActuatorCommand::SetSpeed(m, _) | ActuatorCommand::Stop(m) if *m == MotorId(3))
        })
        .collect();
    assert_eq!(
        drive,
        vec![
            ActuatorCommand::SetSpeed(MotorId(3), 0.4),
            ActuatorCommand::SetSpeed(MotorId(3), 0.2),
            ActuatorCommand::SetSpeed(MotorId(3), 0.4),
            ActuatorCommand::Stop(MotorId(3)),
        ]
    );
    // Only the handshake to the idle C1 was refused
    assert_eq!(rig.metrics.rejected_total(), 1);
    assert_eq!(rig.metrics.unidentified_total(), 0);
}

#[test]
fn test_paired_correlation_never_expires() {
    let mut rig = Rig::new(Config::default().with_identification_window_ms(500));
    let t0 = Instant::now();

    rig.edge("S2_ENTRY", true, t0);
    rig.tag("NFC2", "P7", t0 + ms(400));
    rig.consumer.sweep(t0 + ms(5000));

    assert_eq!(rig.station(2), StationState::Processing);
    assert_eq!(rig.consumer.fusion().pending_len(), 0);
    assert_eq!(rig.metrics.unidentified_total(), 0);
    assert_eq!(rig.metrics.ghost_total(), 0);
}

#[test]
fn test_late_tag_is_not_paired_with_expired_entry() {
    let mut rig = Rig::new(Config::default().with_identification_window_ms(500));
    let t0 = Instant::now();

    rig.edge("S2_ENTRY", true, t0);
    // No sweep in between: the stale entry must still expire, not pair
    rig.tag("NFC2", "P9", t0 + ms(600));

    assert_eq!(rig.metrics.unidentified_total(), 1);
    assert_eq!(rig.station(2), StationState::Idle);
    assert!(rig.sim.commands().contains(&ActuatorCommand::Stop(MotorId(4))));

    // The late read is now the lone half and becomes a ghost
    rig.consumer.sweep(t0 + ms(1200));
    assert_eq!(rig.metrics.ghost_total(), 1);
    assert!(rig.consumer.cell().parts().get(&PartId::new("P9")).is_none());

    let alerts = rig.alert_kinds();
    assert_eq!(alerts.iter().filter(|k| *k == "part_unidentified").count(), 1);
    assert_eq!(alerts.iter().filter(|k| *k == "ghost_tag_read").count(), 1);
}

#[test]
fn test_collision_refusal_then_grant() {
    let mut rig = Rig::new(Config::default());
    let t0 = Instant::now();

    rig.edge("C1_POS", true, t0);
    assert!(matches!(rig.corner(1), CornerState::WaitingForConfirmation { .. }));

    // C4 shares a path with C1
    rig.edge("S1_EXIT", true, t0 + ms(50));
    assert_eq!(rig.corner(4), CornerState::Idle);
    assert!(rig.consumer.cell().corner(CornerId(4)).unwrap().status().pending_approach);
    assert_eq!(rig.metrics.corner_refusals_total(), 1);

    // Part reaches S1: C1 gets its handshake and lets go
    rig.edge("S1_ENTRY", true, t0 + ms(100));
    assert_eq!(rig.corner(1), CornerState::Idle);

    rig.consumer.sweep(t0 + ms(200));
    assert!(matches!(rig.corner(4), CornerState::WaitingForConfirmation { .. }));
    assert!(!rig.consumer.cell().corner(CornerId(4)).unwrap().status().pending_approach);
    assert_eq!(rig.collision.snapshot().awaiting_handshake, vec![CornerId(4)]);
    // Retries do not count as new refusals
    assert_eq!(rig.metrics.corner_refusals_total(), 1);
}

#[test]
fn test_corner_reuse_waits_for_minimum_interval() {
    let mut rig = Rig::new(Config::default());
    let t0 = Instant::now();

    rig.edge("C3_POS", true, t0);
    rig.edge("S2_ENTRY", true, t0 + ms(100));
    assert_eq!(rig.corner(3), CornerState::Idle);

    rig.edge("C3_POS", true, t0 + ms(500));
    assert_eq!(rig.corner(3), CornerState::Idle);

    rig.consumer.sweep(t0 + ms(1000));
    assert_eq!(rig.corner(3), CornerState::Idle);

    rig.consumer.sweep(t0 + ms(2200));
    assert!(matches!(rig.corner(3), CornerState::WaitingForConfirmation { .. }));
}

#[test]
fn test_handshake_timeout_raises_exactly_one_alert() {
    let mut rig = Rig::new(Config::default());
    let t0 = Instant::now();

    rig.edge("C3_POS", true, t0);
    rig.consumer.sweep(t0 + ms(4900));
    assert!(matches!(rig.corner(3), CornerState::WaitingForConfirmation { .. }));

    rig.consumer.sweep(t0 + ms(5050));
    assert_eq!(rig.corner(3), CornerState::Idle);
    rig.consumer.sweep(t0 + ms(5100));
    rig.consumer.sweep(t0 + ms(9000));

    assert_eq!(rig.metrics.handshake_timeouts_total(), 1);
    assert_eq!(rig.alert_kinds(), vec!["handshake_timeout".to_string()]);
    assert_eq!(rig.collision.snapshot(), Default::default());

    let commands = rig.sim.commands();
    assert!(commands.contains(&ActuatorCommand::Retract(MotorId(7))));
    assert_eq!(commands.last(), Some(&ActuatorCommand::SetSpeed(MotorId(2), 0.5)));

    // A handshake after the timeout finds the corner idle
    rig.edge("S2_ENTRY", true, t0 + ms(9500));
    assert_eq!(rig.metrics.rejected_total(), 1);
    assert_eq!(rig.alert_kinds(), vec!["invalid_transition".to_string()]);
}

#[test]
fn test_release_is_idempotent() {
    let config = Config::default();
    let collision = CollisionManager::new(
        config.topology().corners(),
        config.mutually_exclusive(),
        config.min_reuse_interval(),
    );
    let t0 = Instant::now();

    // Releasing a corner that was never granted starts no cooldown
    collision.release_corner(CornerId(3), t0);
    collision.release_corner(CornerId(3), t0);
    collision.request_corner(CornerId(3), t0).unwrap();

    collision.release_corner(CornerId(3), t0 + ms(10));
    collision.release_corner(CornerId(3), t0 + ms(20));
    assert_eq!(collision.snapshot(), Default::default());
    assert!(collision.try_reset());
}

#[test]
fn test_identification_rejected_outside_entering() {
    let config = Config::default();
    let collision = Arc::new(CollisionManager::new(
        config.topology().corners(),
        config.mutually_exclusive(),
        config.min_reuse_interval(),
    ));
    let (telemetry, _rx) = create_telemetry_channel(64, "lab".to_string());
    let mut cell = Cell::new(
        &config,
        collision,
        Arc::new(SimulatedActuators::new()),
        telemetry,
        Arc::new(Metrics::new()),
    );
    let s1 = UnitId::Station(StationId(1));
    let now = Instant::now();
    let identified =
        || FusedEvent::new(FusedKind::PartIdentified, s1, now).with_part(PartId::new("P1"));

    let err = cell.deliver(&identified(), now).unwrap_err();
    assert!(matches!(err, Rejection::InvalidTransition { state: "idle", .. }));
    assert_eq!(cell.station(StationId(1)).unwrap().state(), StationState::Idle);

    cell.deliver(&FusedEvent::new(FusedKind::PartArrivedAtStationEntry, s1, now), now).unwrap();
    cell.deliver(&identified(), now).unwrap();
    cell.deliver(&FusedEvent::new(FusedKind::ProcessComplete, s1, now), now).unwrap();
    assert_eq!(cell.station(StationId(1)).unwrap().state(), StationState::Exiting);

    let err = cell.deliver(&identified(), now).unwrap_err();
    assert!(matches!(err, Rejection::InvalidTransition { state: "exiting", .. }));
    assert_eq!(cell.station(StationId(1)).unwrap().state(), StationState::Exiting);
}

#[test]
fn test_queue_overflow_policies() {
    let config = Config::default();
    let t0 = Instant::now();
    let event = |i: u64| RawEvent::edge(RawSource::Edge, "C1_POS", true, t0 + ms(i));

    let metrics = Arc::new(Metrics::new());
    let mut queues = QueueSet::build(
        config.topology(),
        3,
        3,
        3,
        OverflowPolicy::DropOldest,
        Some(metrics.clone()),
    );
    for i in 0..5 {
        queues.enqueue(event(i));
    }
    assert_eq!(queues.total_len(), 3);
    assert_eq!(metrics.dropped_total(RawSource::Edge), 2);
    assert_eq!(queues.try_pop().unwrap().timestamp, t0 + ms(2));

    let metrics = Arc::new(Metrics::new());
    let mut queues =
        QueueSet::build(config.topology(), 3, 3, 3, OverflowPolicy::Reject, Some(metrics.clone()));
    for i in 0..3 {
        assert_eq!(queues.enqueue(event(i)), EnqueueOutcome::Queued);
    }
    assert_eq!(queues.enqueue(event(3)), EnqueueOutcome::Rejected);
    assert_eq!(metrics.dropped_total(RawSource::Edge), 1);
    assert_eq!(queues.try_pop().unwrap().timestamp, t0);
}
