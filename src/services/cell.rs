//! Controller registry for the cell
//!
//! Owns every station and corner controller plus the part registry, and
//! routes each fused event to exactly one controller by unit id.

use crate::domain::part::PartRegistry;
use crate::domain::types::{CornerId, FusedEvent, StationId, UnitId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::actuators::ActuatorSink;
use crate::io::telemetry::TelemetrySender;
use crate::services::collision::CollisionManager;
use crate::services::corner::{CornerController, CornerSpeeds, CornerStatus};
use crate::services::station::{StationController, StationSpeeds, StationStatus};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// A fused event a controller refused; logged as an alert, never fatal
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Rejection {
    #[error("{unit} cannot accept {event} while {state}")]
    InvalidTransition { unit: UnitId, state: &'static str, event: &'static str },
    #[error("{unit}: part arrived while {state}, entrance queuing failed")]
    QueuingFault { unit: UnitId, state: &'static str },
    #[error("{unit}: {event} without a part id")]
    MissingPart { unit: UnitId, event: &'static str },
    #[error("no controller for unit {0}")]
    UnknownUnit(UnitId),
}

impl Rejection {
    /// Alert class used on the telemetry channel
    pub fn alert_kind(&self) -> &'static str {
        match self {
            Rejection::InvalidTransition { .. } => "invalid_transition",
            Rejection::QueuingFault { .. } => "queuing_fault",
            Rejection::MissingPart { .. } => "invalid_event",
            Rejection::UnknownUnit(_) => "unknown_unit",
        }
    }

    pub fn unit(&self) -> UnitId {
        match *self {
            Rejection::InvalidTransition { unit, .. }
            | Rejection::QueuingFault { unit, .. }
            | Rejection::MissingPart { unit, .. }
            | Rejection::UnknownUnit(unit) => unit,
        }
    }
}

pub struct Cell {
    stations: Vec<StationController>,
    corners: Vec<CornerController>,
    parts: PartRegistry,
}

impl Cell {
    pub fn new(
        config: &Config,
        collision: Arc<CollisionManager>,
        actuators: Arc<dyn ActuatorSink>,
        telemetry: TelemetrySender,
        metrics: Arc<Metrics>,
    ) -> Self {
        let topology = config.topology();
        let station_speeds = StationSpeeds {
            entry: config.station_speed(),
            process: config.process_speed(),
            exit: config.station_speed(),
        };
        let corner_speeds =
            CornerSpeeds { pusher: config.corner_speed(), conveyor: config.conveyor_speed() };

        let stations = topology
            .stations()
            .iter()
            .map(|spec| {
                StationController::new(
                    *spec,
                    station_speeds,
                    actuators.clone(),
                    telemetry.clone(),
                    metrics.clone(),
                )
            })
            .collect();
        let corners = topology
            .corners()
            .iter()
            .map(|spec| {
                CornerController::new(
                    *spec,
                    corner_speeds,
                    collision.clone(),
                    actuators.clone(),
                    telemetry.clone(),
                    metrics.clone(),
                )
            })
            .collect();

        Self { stations, corners, parts: PartRegistry::new() }
    }

    /// Route one fused event to its controller
    pub fn deliver(&mut self, event: &FusedEvent, now: Instant) -> Result<(), Rejection> {
        match event.target {
            UnitId::Station(id) => {
                let station = self
                    .stations
                    .iter_mut()
                    .find(|s| s.id() == id)
                    .ok_or(Rejection::UnknownUnit(event.target))?;
                station.process_event(event, &mut self.parts)
            }
            UnitId::Corner(id) => {
                let corner = self
                    .corners
                    .iter_mut()
                    .find(|c| c.id() == id)
                    .ok_or(Rejection::UnknownUnit(event.target))?;
                corner.process_event(event, now)
            }
        }
    }

    /// Timeout and retry pass over every corner
    pub fn tick(&mut self, now: Instant) {
        for corner in &mut self.corners {
            corner.tick(now);
        }
    }

    /// Shutdown has begun: corners finish what they started and begin nothing new
    pub fn halt_corners(&mut self) {
        for corner in &mut self.corners {
            corner.halt();
        }
    }

    pub fn any_awaiting_handshake(&self) -> bool {
        self.corners.iter().any(CornerController::is_awaiting_handshake)
    }

    pub fn station(&self, id: StationId) -> Option<&StationController> {
        self.stations.iter().find(|s| s.id() == id)
    }

    pub fn corner(&self, id: CornerId) -> Option<&CornerController> {
        self.corners.iter().find(|c| c.id() == id)
    }

    pub fn station_status(&self) -> Vec<StationStatus> {
        self.stations.iter().map(StationController::status).collect()
    }

    pub fn corner_status(&self) -> Vec<CornerStatus> {
        self.corners.iter().map(CornerController::status).collect()
    }

    pub fn parts(&self) -> &PartRegistry {
        &self.parts
    }
}
