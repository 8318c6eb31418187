//! Station controller - passive FSM for one processing station
//!
//! Idle -> Entering -> Processing -> Exiting -> Idle
//!
//! Driven only by fused events delivered from the consumer task. Transitions
//! are computed by the pure `transition` function; the controller applies the
//! resulting drive command and keeps part history.

use crate::domain::part::{PartActivity, PartRegistry};
use crate::domain::topology::StationSpec;
use crate::domain::types::{FusedEvent, FusedKind, PartId, StationId, UnitId};
use crate::infra::metrics::Metrics;
use crate::io::actuators::ActuatorSink;
use crate::io::telemetry::TelemetrySender;
use crate::services::cell::Rejection;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    Idle,
    Entering,
    Processing,
    Exiting,
}

impl StationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationState::Idle => "idle",
            StationState::Entering => "entering",
            StationState::Processing => "processing",
            StationState::Exiting => "exiting",
        }
    }
}

/// Drive motor command attached to a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    Entry,
    Process,
    Exit,
    Stop,
}

/// Outcome of an accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationStep {
    pub next: StationState,
    pub drive: Option<Drive>,
}

impl StationStep {
    fn to(next: StationState, drive: Drive) -> Self {
        Self { next, drive: Some(drive) }
    }

    fn stay(state: StationState) -> Self {
        Self { next: state, drive: None }
    }
}

/// Total transition function; `None` means the event is invalid in `state`
pub fn transition(state: StationState, kind: FusedKind) -> Option<StationStep> {
    use FusedKind::*;
    use StationState::*;

    match (state, kind) {
        (Idle, PartArrivedAtStationEntry) => Some(StationStep::to(Entering, Drive::Entry)),
        (Entering, PartIdentified) => Some(StationStep::to(Processing, Drive::Process)),
        (Processing, ProcessComplete) => Some(StationStep::to(Exiting, Drive::Exit)),
        (Exiting, PartExitedStation) => Some(StationStep::to(Idle, Drive::Stop)),

        // Entry sensor tripped but no tag ever followed: treat as a jam
        (Entering, PartUnidentified) => Some(StationStep::to(Idle, Drive::Stop)),
        (Processing, ProcessStalled) => {
            Some(StationStep { next: Processing, drive: Some(Drive::Stop) })
        }
        (s, PartUnidentified | GhostTagRead | ProcessStalled) => Some(StationStep::stay(s)),

        _ => None,
    }
}

/// Drive speeds for the station belt (unsigned, direction applied per station)
#[derive(Debug, Clone, Copy)]
pub struct StationSpeeds {
    pub entry: f64,
    pub process: f64,
    pub exit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationStatus {
    pub id: StationId,
    pub state: StationState,
    pub part_id: Option<PartId>,
    /// A part is present but not yet identified
    pub pending_identification: bool,
}

/// Part currently held by the station
#[derive(Debug, Clone)]
struct CurrentPart {
    part_id: Option<PartId>,
    arrived_at: Instant,
}

pub struct StationController {
    spec: StationSpec,
    state: StationState,
    current_part: Option<CurrentPart>,
    speeds: StationSpeeds,
    actuators: Arc<dyn ActuatorSink>,
    telemetry: TelemetrySender,
    metrics: Arc<Metrics>,
}

impl StationController {
    pub fn new(
        spec: StationSpec,
        speeds: StationSpeeds,
        actuators: Arc<dyn ActuatorSink>,
        telemetry: TelemetrySender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            spec,
            state: StationState::Idle,
            current_part: None,
            speeds,
            actuators,
            telemetry,
            metrics,
        }
    }

    pub fn id(&self) -> StationId {
        self.spec.id
    }

    #[inline]
    fn unit(&self) -> UnitId {
        UnitId::Station(self.spec.id)
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    pub fn status(&self) -> StationStatus {
        StationStatus {
            id: self.spec.id,
            state: self.state,
            part_id: self.current_part.as_ref().and_then(|p| p.part_id.clone()),
            pending_identification: self
                .current_part
                .as_ref()
                .is_some_and(|p| p.part_id.is_none()),
        }
    }

    /// Accept one fused event addressed to this station
    pub fn process_event(
        &mut self,
        event: &FusedEvent,
        parts: &mut PartRegistry,
    ) -> Result<(), Rejection> {
        let Some(step) = transition(self.state, event.kind) else {
            let unit = self.unit();
            return Err(if event.kind == FusedKind::PartArrivedAtStationEntry {
                // Software queuing at the entrance failed or was bypassed
                Rejection::QueuingFault { unit, state: self.state.as_str() }
            } else {
                Rejection::InvalidTransition {
                    unit,
                    state: self.state.as_str(),
                    event: event.kind.as_str(),
                }
            });
        };

        if event.kind == FusedKind::PartIdentified && event.part_id.is_none() {
            return Err(Rejection::MissingPart { unit: self.unit(), event: event.kind.as_str() });
        }

        self.apply_effects(event, parts);

        if let Some(drive) = step.drive {
            self.command(drive);
        }

        if step.next != self.state {
            info!(
                station = %self.spec.id,
                from = %self.state.as_str(),
                to = %step.next.as_str(),
                event = %event.kind.as_str(),
                "station_transition"
            );
        }
        self.state = step.next;
        Ok(())
    }

    /// Part bookkeeping for an accepted event
    fn apply_effects(&mut self, event: &FusedEvent, parts: &mut PartRegistry) {
        let unit = self.unit();
        match (self.state, event.kind) {
            (StationState::Idle, FusedKind::PartArrivedAtStationEntry) => {
                self.current_part = Some(CurrentPart { part_id: None, arrived_at: event.timestamp });
            }
            (StationState::Entering, FusedKind::PartIdentified) => {
                let Some(part_id) = event.part_id.clone() else {
                    return;
                };
                let arrived_at =
                    self.current_part.as_ref().map_or(event.timestamp, |p| p.arrived_at);
                parts.record(&part_id, unit, PartActivity::Enter, arrived_at);
                parts.record(&part_id, unit, PartActivity::ProcessStart, event.timestamp);
                self.telemetry.log_event(Some(&part_id), unit, PartActivity::Enter.as_str());
                self.telemetry.log_event(Some(&part_id), unit, PartActivity::ProcessStart.as_str());
                self.current_part = Some(CurrentPart { part_id: Some(part_id), arrived_at });
            }
            (StationState::Processing, FusedKind::ProcessComplete) => {
                if let Some(part_id) = self.current_part.as_ref().and_then(|p| p.part_id.as_ref()) {
                    parts.record(part_id, unit, PartActivity::ProcessEnd, event.timestamp);
                    self.telemetry.log_event(Some(part_id), unit, PartActivity::ProcessEnd.as_str());
                }
            }
            (StationState::Exiting, FusedKind::PartExitedStation) => {
                if let Some(part_id) = self.current_part.take().and_then(|p| p.part_id) {
                    parts.record(&part_id, unit, PartActivity::Exit, event.timestamp);
                    self.telemetry.log_event(Some(&part_id), unit, PartActivity::Exit.as_str());
                }
            }
            (StationState::Entering, FusedKind::PartUnidentified) => {
                warn!(station = %self.spec.id, "station_jam_unidentified_part");
                self.current_part = None;
            }
            (StationState::Processing, FusedKind::ProcessStalled) => {
                warn!(
                    station = %self.spec.id,
                    part_id = ?self.current_part.as_ref().and_then(|p| p.part_id.as_ref()),
                    "station_process_stalled"
                );
            }
            (state, kind) if kind.is_alert() => {
                debug!(
                    station = %self.spec.id,
                    state = %state.as_str(),
                    event = %kind.as_str(),
                    part_id = ?event.part_id,
                    "station_alert_ignored"
                );
            }
            _ => {}
        }
    }

    /// Issue a drive command; failures are logged, never rolled back
    fn command(&self, drive: Drive) {
        let motor = self.spec.drive_motor;
        let result = match drive {
            Drive::Entry => self.actuators.set_speed(motor, self.speeds.entry * self.spec.direction),
            Drive::Process => {
                self.actuators.set_speed(motor, self.speeds.process * self.spec.direction)
            }
            Drive::Exit => self.actuators.set_speed(motor, self.speeds.exit * self.spec.direction),
            Drive::Stop => self.actuators.stop(motor),
        };
        if let Err(e) = result {
            warn!(station = %self.spec.id, drive = ?drive, error = %e, "station_actuator_failed");
            self.metrics.record_actuator_failure();
            self.telemetry.publish_alert("actuator_failure", Some(self.unit()), None, e.to_string());
        }
    }
}
