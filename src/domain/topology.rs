//! Fixed cell topology: stations, corners, motors and the channel role table
//!
//! The lab cell is a closed loop:
//! M1 -> C1 -> S1 -> C4 -> M2 -> C3 -> S2 -> C2 -> M1

use super::types::{ChannelId, CornerId, MotorId, RawSource, StationId, UnitId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a corner takes parts from or pushes them to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Station(StationId),
    Conveyor(MotorId),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Station(id) => id.fmt(f),
            Endpoint::Conveyor(id) => id.fmt(f),
        }
    }
}

/// Role names as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    StationEntry,
    TagReader,
    StationProcess,
    StationExit,
    CornerApproach,
    ConveyorStart,
}

/// What a physical channel means to the fusion engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    StationEntry(StationId),
    TagReader(StationId),
    StationProcess(StationId),
    StationExit(StationId),
    CornerApproach(CornerId),
    ConveyorStart(MotorId),
}

impl ChannelRole {
    pub fn from_parts(kind: RoleKind, unit: u8) -> Self {
        match kind {
            RoleKind::StationEntry => ChannelRole::StationEntry(StationId(unit)),
            RoleKind::TagReader => ChannelRole::TagReader(StationId(unit)),
            RoleKind::StationProcess => ChannelRole::StationProcess(StationId(unit)),
            RoleKind::StationExit => ChannelRole::StationExit(StationId(unit)),
            RoleKind::CornerApproach => ChannelRole::CornerApproach(CornerId(unit)),
            RoleKind::ConveyorStart => ChannelRole::ConveyorStart(MotorId(unit)),
        }
    }

    /// Unit referenced by this role, for validation
    fn referenced_unit(&self) -> Option<UnitId> {
        match *self {
            ChannelRole::StationEntry(s)
            | ChannelRole::TagReader(s)
            | ChannelRole::StationProcess(s)
            | ChannelRole::StationExit(s) => Some(UnitId::Station(s)),
            ChannelRole::CornerApproach(c) => Some(UnitId::Corner(c)),
            ChannelRole::ConveyorStart(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub source: RawSource,
    pub role: ChannelRole,
    /// Analog readings at or above this value count as a high level
    pub analog_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationSpec {
    pub id: StationId,
    pub drive_motor: MotorId,
    /// -1.0 when the station belt runs against the motor's positive direction
    pub direction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerSpec {
    pub id: CornerId,
    pub pusher_motor: MotorId,
    pub fed_from: Endpoint,
    pub delivers_to: Endpoint,
    pub handshake_timeout: Duration,
}

impl CornerSpec {
    /// Conveyor that must be stopped while this corner extends
    pub fn feed_conveyor(&self) -> Option<MotorId> {
        match self.fed_from {
            Endpoint::Conveyor(m) => Some(m),
            Endpoint::Station(_) => None,
        }
    }

    /// True if the corner takes parts from or pushes parts onto conveyor `motor`
    pub fn is_on_segment(&self, motor: MotorId) -> bool {
        self.fed_from == Endpoint::Conveyor(motor) || self.delivers_to == Endpoint::Conveyor(motor)
    }
}

/// Immutable description of the cell, shared by the fusion engine and controllers
#[derive(Debug, Clone)]
pub struct Topology {
    stations: Vec<StationSpec>,
    corners: Vec<CornerSpec>,
    channels: FxHashMap<ChannelId, ChannelSpec>,
}

impl Topology {
    /// Build and validate a topology
    pub fn new(
        stations: Vec<StationSpec>,
        corners: Vec<CornerSpec>,
        channels: Vec<ChannelSpec>,
    ) -> anyhow::Result<Self> {
        let mut map = FxHashMap::default();
        let topology_units = |unit: UnitId| match unit {
            UnitId::Station(s) => stations.iter().any(|spec| spec.id == s),
            UnitId::Corner(c) => corners.iter().any(|spec| spec.id == c),
        };

        for corner in &corners {
            if let Endpoint::Station(s) = corner.fed_from {
                anyhow::ensure!(
                    topology_units(UnitId::Station(s)),
                    "corner {} is fed from unknown station {}",
                    corner.id,
                    s
                );
            }
            if let Endpoint::Station(s) = corner.delivers_to {
                anyhow::ensure!(
                    topology_units(UnitId::Station(s)),
                    "corner {} delivers to unknown station {}",
                    corner.id,
                    s
                );
            }
        }

        for channel in channels {
            if let Some(unit) = channel.role.referenced_unit() {
                anyhow::ensure!(
                    topology_units(unit),
                    "channel {} references unknown unit {}",
                    channel.id,
                    unit
                );
            }
            let tag_role = matches!(channel.role, ChannelRole::TagReader(_));
            anyhow::ensure!(
                tag_role == (channel.source == RawSource::Tag),
                "channel {}: tag readers must use the tag source and only them",
                channel.id
            );
            anyhow::ensure!(!map.contains_key(&channel.id), "duplicate channel id {}", channel.id);
            map.insert(channel.id.clone(), channel);
        }

        Ok(Self { stations, corners, channels: map })
    }

    /// Same layout with every corner's handshake timeout replaced
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        for corner in &mut self.corners {
            corner.handshake_timeout = handshake_timeout;
        }
        self
    }

    /// The lab cell as wired: 2 stations, 4 corners, 8 motors
    pub fn lab_cell(handshake_timeout: Duration) -> Self {
        let stations = vec![
            StationSpec { id: StationId(1), drive_motor: MotorId(3), direction: 1.0 },
            StationSpec { id: StationId(2), drive_motor: MotorId(4), direction: -1.0 },
        ];
        let corner = |id: u8, pusher: u8, fed_from: Endpoint, delivers_to: Endpoint| CornerSpec {
            id: CornerId(id),
            pusher_motor: MotorId(pusher),
            fed_from,
            delivers_to,
            handshake_timeout,
        };
        let corners = vec![
            corner(1, 5, Endpoint::Conveyor(MotorId(1)), Endpoint::Station(StationId(1))),
            corner(2, 6, Endpoint::Station(StationId(2)), Endpoint::Conveyor(MotorId(1))),
            corner(3, 7, Endpoint::Conveyor(MotorId(2)), Endpoint::Station(StationId(2))),
            corner(4, 8, Endpoint::Station(StationId(1)), Endpoint::Conveyor(MotorId(2))),
        ];
        let channels = default_channels()
            .into_iter()
            .map(|(id, source, role)| {
                let spec =
                    ChannelSpec { id: ChannelId::new(id), source, role, analog_threshold: 0.5 };
                (spec.id.clone(), spec)
            })
            .collect();
        Self { stations, corners, channels }
    }

    pub fn stations(&self) -> &[StationSpec] {
        &self.stations
    }

    pub fn corners(&self) -> &[CornerSpec] {
        &self.corners
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.values()
    }

    #[inline]
    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelSpec> {
        self.channels.get(id)
    }

    pub fn station(&self, id: StationId) -> Option<&StationSpec> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn corner(&self, id: CornerId) -> Option<&CornerSpec> {
        self.corners.iter().find(|c| c.id == id)
    }

    /// Corner pushing parts into `endpoint`
    pub fn corner_delivering_to(&self, endpoint: Endpoint) -> Option<CornerId> {
        self.corners.iter().find(|c| c.delivers_to == endpoint).map(|c| c.id)
    }

    /// Corner taking parts from `endpoint`
    pub fn corner_fed_from(&self, endpoint: Endpoint) -> Option<CornerId> {
        self.corners.iter().find(|c| c.fed_from == endpoint).map(|c| c.id)
    }

    /// Distinct conveyor motors referenced by any corner
    pub fn conveyors(&self) -> Vec<MotorId> {
        let mut motors: Vec<MotorId> = self
            .corners
            .iter()
            .flat_map(|c| [c.fed_from, c.delivers_to])
            .filter_map(|e| match e {
                Endpoint::Conveyor(m) => Some(m),
                Endpoint::Station(_) => None,
            })
            .collect();
        motors.sort();
        motors.dedup();
        motors
    }
}

/// Channel table of the lab cell wiring
pub fn default_channels() -> Vec<(&'static str, RawSource, ChannelRole)> {
    vec![
        ("S1_ENTRY", RawSource::Edge, ChannelRole::StationEntry(StationId(1))),
        ("S1_PROCESS", RawSource::Edge, ChannelRole::StationProcess(StationId(1))),
        ("S1_EXIT", RawSource::Edge, ChannelRole::StationExit(StationId(1))),
        ("S2_ENTRY", RawSource::Edge, ChannelRole::StationEntry(StationId(2))),
        ("S2_PROCESS", RawSource::Edge, ChannelRole::StationProcess(StationId(2))),
        ("S2_EXIT", RawSource::Edge, ChannelRole::StationExit(StationId(2))),
        ("C1_POS", RawSource::Edge, ChannelRole::CornerApproach(CornerId(1))),
        ("C3_POS", RawSource::Edge, ChannelRole::CornerApproach(CornerId(3))),
        ("M1_START", RawSource::Polled, ChannelRole::ConveyorStart(MotorId(1))),
        ("M2_START", RawSource::Polled, ChannelRole::ConveyorStart(MotorId(2))),
        ("NFC1", RawSource::Tag, ChannelRole::TagReader(StationId(1))),
        ("NFC2", RawSource::Tag, ChannelRole::TagReader(StationId(2))),
    ]
}
