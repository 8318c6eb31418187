//! Corner controller - passive FSM for one corner transfer pusher
//!
//! Idle -> Extending -> WaitingForConfirmation -> Retracting -> Idle
//!
//! Extending and Retracting last only as long as issuing the actuator
//! command, so one delivery can pass through several states. Access to the
//! corner is arbitrated by the collision manager; a refused or early
//! approach is kept as a single pending approach and retried on `tick`.

use crate::domain::topology::CornerSpec;
use crate::domain::types::{as_millis, CornerId, FusedEvent, FusedKind, UnitId};
use crate::infra::metrics::Metrics;
use crate::io::actuators::{ActuatorError, ActuatorSink};
use crate::io::telemetry::TelemetrySender;
use crate::services::cell::Rejection;
use crate::services::collision::CollisionManager;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CornerState {
    Idle,
    Extending,
    WaitingForConfirmation { deadline: Instant },
    Retracting,
}

impl CornerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CornerState::Idle => "idle",
            CornerState::Extending => "extending",
            CornerState::WaitingForConfirmation { .. } => "waiting_for_confirmation",
            CornerState::Retracting => "retracting",
        }
    }
}

/// Inputs to the corner FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CornerInput {
    /// Part approaching; `granted` is the collision manager's answer
    Approach { granted: bool },
    ExtendIssued { now: Instant },
    Handshake,
    Timeout,
    RetractIssued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CornerAction {
    StopFeed,
    Extend,
    MarkAwaiting,
    Retract,
    RaiseTimeoutAlert,
    Release,
    RestartFeed,
    QueueApproach,
}

pub type CornerActions = SmallVec<[CornerAction; 4]>;

/// Total transition function; `None` means the input is invalid in `state`
pub fn transition(
    state: CornerState,
    input: CornerInput,
    handshake_timeout: Duration,
) -> Option<(CornerState, CornerActions)> {
    use CornerAction::*;
    use CornerState::*;

    let step = |next: CornerState, actions: &[CornerAction]| {
        Some((next, actions.iter().copied().collect::<CornerActions>()))
    };

    match (state, input) {
        (Idle, CornerInput::Approach { granted: true }) => step(Extending, &[StopFeed, Extend]),
        (_, CornerInput::Approach { .. }) => step(state, &[QueueApproach]),
        (Extending, CornerInput::ExtendIssued { now }) => step(
            WaitingForConfirmation { deadline: now + handshake_timeout },
            &[MarkAwaiting],
        ),
        (WaitingForConfirmation { .. }, CornerInput::Handshake) => step(Retracting, &[Retract]),
        (WaitingForConfirmation { .. }, CornerInput::Timeout) => {
            step(Retracting, &[RaiseTimeoutAlert, Retract])
        }
        (Retracting, CornerInput::RetractIssued) => step(Idle, &[Release, RestartFeed]),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CornerSpeeds {
    pub pusher: f64,
    pub conveyor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CornerStatus {
    pub id: CornerId,
    pub state: CornerState,
    pub pending_approach: bool,
}

pub struct CornerController {
    spec: CornerSpec,
    state: CornerState,
    pending_approach: bool,
    /// Set once shutdown starts; no new push is begun after that
    halted: bool,
    speeds: CornerSpeeds,
    collision: Arc<CollisionManager>,
    actuators: Arc<dyn ActuatorSink>,
    telemetry: TelemetrySender,
    metrics: Arc<Metrics>,
}

impl CornerController {
    pub fn new(
        spec: CornerSpec,
        speeds: CornerSpeeds,
        collision: Arc<CollisionManager>,
        actuators: Arc<dyn ActuatorSink>,
        telemetry: TelemetrySender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            spec,
            state: CornerState::Idle,
            pending_approach: false,
            halted: false,
            speeds,
            collision,
            actuators,
            telemetry,
            metrics,
        }
    }

    pub fn id(&self) -> CornerId {
        self.spec.id
    }

    #[inline]
    fn unit(&self) -> UnitId {
        UnitId::Corner(self.spec.id)
    }

    pub fn state(&self) -> CornerState {
        self.state
    }

    pub fn status(&self) -> CornerStatus {
        CornerStatus { id: self.spec.id, state: self.state, pending_approach: self.pending_approach }
    }

    pub fn is_awaiting_handshake(&self) -> bool {
        matches!(self.state, CornerState::WaitingForConfirmation { .. })
    }

    /// Stop starting pushes; a push already under way still completes or times out
    pub fn halt(&mut self) {
        self.halted = true;
        if self.pending_approach {
            self.pending_approach = false;
            info!(corner = %self.spec.id, "corner_pending_approach_dropped");
        }
    }

    /// Accept one fused event addressed to this corner
    pub fn process_event(&mut self, event: &FusedEvent, now: Instant) -> Result<(), Rejection> {
        let input = match event.kind {
            FusedKind::CornerApproachDetected if self.halted => {
                debug!(corner = %self.spec.id, "corner_approach_ignored_halted");
                return Ok(());
            }
            FusedKind::CornerApproachDetected => {
                let granted = self.state == CornerState::Idle && self.acquire(now, true);
                CornerInput::Approach { granted }
            }
            FusedKind::CornerHandshakeConfirmed => CornerInput::Handshake,
            kind => {
                return Err(Rejection::InvalidTransition {
                    unit: self.unit(),
                    state: self.state.as_str(),
                    event: kind.as_str(),
                })
            }
        };
        let state = self.state.as_str();
        if self.step(input, now) {
            Ok(())
        } else {
            Err(Rejection::InvalidTransition { unit: self.unit(), state, event: event.kind.as_str() })
        }
    }

    /// Handshake timeout check and pending-approach retry
    pub fn tick(&mut self, now: Instant) {
        if let CornerState::WaitingForConfirmation { deadline } = self.state {
            if now >= deadline {
                self.step(CornerInput::Timeout, now);
            }
        }
        if self.halted {
            return;
        }
        if self.pending_approach && self.state == CornerState::Idle && self.acquire(now, false) {
            self.pending_approach = false;
            self.step(CornerInput::Approach { granted: true }, now);
        }
    }

    /// Ask the collision manager for the corner, checking the feed belt first
    fn acquire(&self, now: Instant, first_attempt: bool) -> bool {
        let outcome = match self.spec.feed_conveyor() {
            Some(m) if !self.collision.is_conveyor_safe_to_stop(m) => Err(None),
            _ => self.collision.request_corner(self.spec.id, now).map_err(Some),
        };
        match outcome {
            Ok(()) => true,
            Err(refusal) => {
                if first_attempt {
                    self.metrics.record_corner_refusal();
                    debug!(corner = %self.spec.id, refusal = ?refusal, "corner_request_refused");
                }
                false
            }
        }
    }

    /// Run one FSM input through, following internal completions to a resting state
    fn step(&mut self, input: CornerInput, now: Instant) -> bool {
        let mut input = input;
        loop {
            let Some((next, actions)) = transition(self.state, input, self.spec.handshake_timeout)
            else {
                return false;
            };
            if next != self.state {
                debug!(
                    corner = %self.spec.id,
                    from = %self.state.as_str(),
                    to = %next.as_str(),
                    "corner_transition"
                );
            }
            self.state = next;
            for action in actions {
                self.perform(action, now);
            }
            input = match self.state {
                CornerState::Extending => CornerInput::ExtendIssued { now },
                CornerState::Retracting => CornerInput::RetractIssued,
                _ => return true,
            };
        }
    }

    fn perform(&mut self, action: CornerAction, now: Instant) {
        let unit = self.unit();
        match action {
            CornerAction::StopFeed => {
                if let Some(m) = self.spec.feed_conveyor() {
                    let result = self.actuators.stop(m);
                    self.check(result, "stop_feed");
                }
            }
            CornerAction::Extend => {
                let result = self.actuators.extend(self.spec.pusher_motor, self.speeds.pusher);
                self.check(result, "extend");
                info!(corner = %self.spec.id, "corner_push_started");
                self.telemetry.log_event(None, unit, "PUSH_START");
            }
            CornerAction::MarkAwaiting => {
                self.collision.mark_awaiting_handshake(self.spec.id);
            }
            CornerAction::Retract => {
                let result = self.actuators.retract(self.spec.pusher_motor, self.speeds.pusher);
                self.check(result, "retract");
            }
            CornerAction::RaiseTimeoutAlert => {
                warn!(
                    corner = %self.spec.id,
                    timeout_ms = %as_millis(self.spec.handshake_timeout),
                    "corner_handshake_timeout"
                );
                self.metrics.record_handshake_timeout();
                self.telemetry.publish_alert(
                    "handshake_timeout",
                    Some(unit),
                    None,
                    format!(
                        "no handshake within {} ms, retracting",
                        as_millis(self.spec.handshake_timeout)
                    ),
                );
            }
            CornerAction::Release => {
                self.collision.release_corner(self.spec.id, now);
                info!(corner = %self.spec.id, "corner_push_complete");
                self.telemetry.log_event(None, unit, "PUSH_COMPLETE");
            }
            CornerAction::RestartFeed => {
                if let Some(m) = self.spec.feed_conveyor() {
                    let result = self.actuators.set_speed(m, self.speeds.conveyor);
                    self.check(result, "restart_feed");
                }
            }
            CornerAction::QueueApproach => {
                if !self.pending_approach {
                    debug!(
                        corner = %self.spec.id,
                        state = %self.state.as_str(),
                        "corner_approach_queued"
                    );
                }
                self.pending_approach = true;
            }
        }
    }

    fn check(&self, result: Result<(), ActuatorError>, command: &'static str) {
        if let Err(e) = result {
            warn!(corner = %self.spec.id, command = %command, error = %e, "corner_actuator_failed");
            self.metrics.record_actuator_failure();
            self.telemetry.publish_alert("actuator_failure", Some(self.unit()), None, e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::Topology;
    use crate::domain::types::MotorId;
    use crate::io::actuators::{ActuatorCommand, SimulatedActuators};
    use crate::io::telemetry::{create_telemetry_channel, TelemetryMessage};

    const SPEEDS: CornerSpeeds = CornerSpeeds { pusher: 0.7, conveyor: 0.5 };

    struct Rig {
        topology: Topology,
        collision: Arc<CollisionManager>,
        sim: Arc<SimulatedActuators>,
        metrics: Arc<Metrics>,
        telemetry: TelemetrySender,
        rx: tokio::sync::mpsc::Receiver<TelemetryMessage>,
    }

    impl Rig {
        fn new() -> Self {
            let topology = Topology::lab_cell(Duration::from_secs(2));
            let collision = Arc::new(CollisionManager::new(
                topology.corners(),
                &[(CornerId(1), CornerId(2))],
                Duration::ZERO,
            ));
            let (telemetry, rx) = create_telemetry_channel(64, "lab".to_string());
            Self {
                topology,
                collision,
                sim: Arc::new(SimulatedActuators::new()),
                metrics: Arc::new(Metrics::new()),
                telemetry,
                rx,
            }
        }

        fn corner(&self, id: u8) -> CornerController {
            let spec = *self.topology.corner(CornerId(id)).unwrap();
            CornerController::new(
                spec,
                SPEEDS,
                self.collision.clone(),
                self.sim.clone(),
                self.telemetry.clone(),
                self.metrics.clone(),
            )
        }

        fn alerts(&mut self) -> Vec<String> {
            let mut alerts = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let TelemetryMessage::Alert(a) = msg {
                    alerts.push(a.kind);
                }
            }
            alerts
        }
    }

    fn ev(kind: FusedKind, corner: u8, at: Instant) -> FusedEvent {
        FusedEvent::new(kind, UnitId::Corner(CornerId(corner)), at)
    }

    #[test]
    fn test_transition_table() {
        let t = Duration::from_secs(2);
        let now = Instant::now();
        let (next, actions) =
            transition(CornerState::Idle, CornerInput::Approach { granted: true }, t).unwrap();
        assert_eq!(next, CornerState::Extending);
        assert_eq!(actions.as_slice(), &[CornerAction::StopFeed, CornerAction::Extend]);

        let (next, _) =
            transition(CornerState::Extending, CornerInput::ExtendIssued { now }, t).unwrap();
        assert_eq!(next, CornerState::WaitingForConfirmation { deadline: now + t });

        let (_, actions) = transition(next, CornerInput::Timeout, t).unwrap();
        assert_eq!(actions.as_slice(), &[CornerAction::RaiseTimeoutAlert, CornerAction::Retract]);

        assert!(transition(CornerState::Idle, CornerInput::Handshake, t).is_none());
        assert!(transition(CornerState::Idle, CornerInput::Timeout, t).is_none());
    }

    #[test]
    fn test_push_cycle_with_handshake() {
        let mut rig = Rig::new();
        let mut c1 = rig.corner(1);
        let t0 = Instant::now();

        c1.process_event(&ev(FusedKind::CornerApproachDetected, 1, t0), t0).unwrap();
        assert!(c1.is_awaiting_handshake());
        assert_eq!(rig.collision.snapshot().awaiting_handshake, vec![CornerId(1)]);

        c1.process_event(&ev(FusedKind::CornerHandshakeConfirmed, 1, t0), t0).unwrap();
        assert_eq!(c1.state(), CornerState::Idle);
        assert!(rig.collision.snapshot().awaiting_handshake.is_empty());
        assert_eq!(
            rig.sim.commands(),
            vec![
                ActuatorCommand::Stop(MotorId(1)),
                ActuatorCommand::Extend(MotorId(5)),
                ActuatorCommand::Retract(MotorId(5)),
                ActuatorCommand::SetSpeed(MotorId(1), 0.5),
            ]
        );
        assert!(rig.alerts().is_empty());
    }

    #[test]
    fn test_timeout_retracts_with_exactly_one_alert() {
        let mut rig = Rig::new();
        let mut c1 = rig.corner(1);
        let t0 = Instant::now();
        c1.process_event(&ev(FusedKind::CornerApproachDetected, 1, t0), t0).unwrap();

        c1.tick(t0 + Duration::from_millis(1990));
        assert!(c1.is_awaiting_handshake());

        c1.tick(t0 + Duration::from_millis(2000));
        c1.tick(t0 + Duration::from_millis(2050));
        assert_eq!(c1.state(), CornerState::Idle);
        assert_eq!(rig.metrics.handshake_timeouts_total(), 1);
        assert_eq!(rig.alerts(), vec!["handshake_timeout".to_string()]);
        assert!(rig.collision.snapshot().occupied.is_empty());
    }

    #[test]
    fn test_refused_approach_is_retried_on_tick() {
        let rig = Rig::new();
        let mut c1 = rig.corner(1);
        let mut c2 = rig.corner(2);
        let t0 = Instant::now();

        c1.process_event(&ev(FusedKind::CornerApproachDetected, 1, t0), t0).unwrap();
        c2.process_event(&ev(FusedKind::CornerApproachDetected, 2, t0), t0).unwrap();
        assert_eq!(c2.state(), CornerState::Idle);
        assert!(c2.status().pending_approach);
        assert_eq!(rig.metrics.corner_refusals_total(), 1);

        c2.tick(t0);
        assert_eq!(c2.state(), CornerState::Idle);

        c1.process_event(&ev(FusedKind::CornerHandshakeConfirmed, 1, t0), t0).unwrap();
        c2.tick(t0);
        assert!(c2.is_awaiting_handshake());
        assert!(!c2.status().pending_approach);
        // Retries are not counted as new refusals
        assert_eq!(rig.metrics.corner_refusals_total(), 1);
    }

    #[test]
    fn test_halted_corner_starts_no_push() {
        let rig = Rig::new();
        let mut c1 = rig.corner(1);
        let mut c2 = rig.corner(2);
        let t0 = Instant::now();

        c1.process_event(&ev(FusedKind::CornerApproachDetected, 1, t0), t0).unwrap();
        c2.process_event(&ev(FusedKind::CornerApproachDetected, 2, t0), t0).unwrap();
        assert!(c2.status().pending_approach);

        c1.halt();
        c2.halt();
        assert!(!c2.status().pending_approach);

        // The push in progress still completes
        c1.process_event(&ev(FusedKind::CornerHandshakeConfirmed, 1, t0), t0).unwrap();
        assert_eq!(c1.state(), CornerState::Idle);

        c2.tick(t0);
        c1.process_event(&ev(FusedKind::CornerApproachDetected, 1, t0), t0).unwrap();
        c1.tick(t0);
        assert_eq!(c1.state(), CornerState::Idle);
        assert_eq!(c2.state(), CornerState::Idle);
        let commands = rig.sim.commands();
        assert!(!commands.contains(&ActuatorCommand::Extend(MotorId(6))));
        let c1_pushes = commands.iter().filter(|c| **c == ActuatorCommand::Extend(MotorId(5)));
        assert_eq!(c1_pushes.count(), 1);
        assert_eq!(rig.collision.snapshot(), Default::default());
    }

    #[test]
    fn test_handshake_when_idle_rejected() {
        let rig = Rig::new();
        let mut c3 = rig.corner(3);
        let now = Instant::now();
        let err =
            c3.process_event(&ev(FusedKind::CornerHandshakeConfirmed, 3, now), now).unwrap_err();
        assert!(matches!(err, Rejection::InvalidTransition { state: "idle", .. }));
    }

    #[test]
    fn test_station_event_rejected() {
        let rig = Rig::new();
        let mut c1 = rig.corner(1);
        let now = Instant::now();
        assert!(c1.process_event(&ev(FusedKind::PartIdentified, 1, now), now).is_err());
    }

    #[test]
    fn test_corner_fed_from_station_leaves_conveyors_alone() {
        let rig = Rig::new();
        let mut c4 = rig.corner(4);
        let now = Instant::now();
        c4.process_event(&ev(FusedKind::CornerApproachDetected, 4, now), now).unwrap();
        c4.process_event(&ev(FusedKind::CornerHandshakeConfirmed, 4, now), now).unwrap();
        assert_eq!(
            rig.sim.commands(),
            vec![ActuatorCommand::Extend(MotorId(8)), ActuatorCommand::Retract(MotorId(8))]
        );
    }
}
