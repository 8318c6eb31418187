//! Shared types for the cell coordinator
//!
//! Raw events are immutable facts from producers; fused events are the
//! domain-level facts the controllers act on.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Newtype wrapper for station numbers (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StationId(pub u8);

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Newtype wrapper for corner numbers (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CornerId(pub u8);

impl std::fmt::Display for CornerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Newtype wrapper for motor numbers (1-8 on the lab cell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MotorId(pub u8);

impl std::fmt::Display for MotorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Part identifier, taken from the NFC tag UID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PartId(pub String);

impl PartId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a part id from a raw tag UID (lowercase hex, as printed on the tags)
    pub fn from_uid(uid: &[u8]) -> Self {
        Self(hex::encode(uid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Physical sensor or reader identifier (e.g. "S1_ENTRY", "NFC1")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Controller instance a fused event is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitId {
    Station(StationId),
    Corner(CornerId),
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitId::Station(id) => id.fmt(f),
            UnitId::Corner(id) => id.fmt(f),
        }
    }
}

/// Producer class; each class has its own queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawSource {
    /// Edge-interrupt sensors (native GPIO)
    Edge,
    /// Polled sensors (GPIO expander)
    Polled,
    /// NFC tag readers
    Tag,
}

impl RawSource {
    pub const ALL: [RawSource; 3] = [RawSource::Edge, RawSource::Polled, RawSource::Tag];

    pub fn as_str(&self) -> &'static str {
        match self {
            RawSource::Edge => "edge",
            RawSource::Polled => "polled",
            RawSource::Tag => "tag",
        }
    }

    /// Stable index for per-class counters
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            RawSource::Edge => 0,
            RawSource::Polled => 1,
            RawSource::Tag => 2,
        }
    }
}

/// Payload carried by a raw event
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Edge(bool),
    Analog(f64),
    Tag(PartId),
}

/// Immutable fact from a producer, consumed exactly once by the CEP consumer
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub source: RawSource,
    pub channel: ChannelId,
    pub payload: RawPayload,
    pub timestamp: Instant,
}

impl RawEvent {
    pub fn edge(source: RawSource, channel: &str, level: bool, timestamp: Instant) -> Self {
        Self { source, channel: ChannelId::new(channel), payload: RawPayload::Edge(level), timestamp }
    }

    pub fn analog(source: RawSource, channel: &str, value: f64, timestamp: Instant) -> Self {
        Self {
            source,
            channel: ChannelId::new(channel),
            payload: RawPayload::Analog(value),
            timestamp,
        }
    }

    pub fn tag(channel: &str, part_id: PartId, timestamp: Instant) -> Self {
        Self {
            source: RawSource::Tag,
            channel: ChannelId::new(channel),
            payload: RawPayload::Tag(part_id),
            timestamp,
        }
    }
}

/// Classification of fused events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusedKind {
    PartArrivedAtStationEntry,
    PartIdentified,
    ProcessComplete,
    PartExitedStation,
    CornerApproachDetected,
    CornerHandshakeConfirmed,
    /// Entry edge never paired with a tag read
    PartUnidentified,
    /// Tag read never paired with an entry edge
    GhostTagRead,
    /// Process sensor rose but never fell
    ProcessStalled,
}

impl FusedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusedKind::PartArrivedAtStationEntry => "part_arrived_at_station_entry",
            FusedKind::PartIdentified => "part_identified",
            FusedKind::ProcessComplete => "process_complete",
            FusedKind::PartExitedStation => "part_exited_station",
            FusedKind::CornerApproachDetected => "corner_approach_detected",
            FusedKind::CornerHandshakeConfirmed => "corner_handshake_confirmed",
            FusedKind::PartUnidentified => "part_unidentified",
            FusedKind::GhostTagRead => "ghost_tag_read",
            FusedKind::ProcessStalled => "process_stalled",
        }
    }

    /// Alert-level kinds represent anomalies rather than nominal progress
    #[inline]
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            FusedKind::PartUnidentified | FusedKind::GhostTagRead | FusedKind::ProcessStalled
        )
    }
}

/// Domain-level fact routed to exactly one controller
#[derive(Debug, Clone, PartialEq)]
pub struct FusedEvent {
    pub kind: FusedKind,
    pub target: UnitId,
    pub part_id: Option<PartId>,
    pub timestamp: Instant,
}

impl FusedEvent {
    #[inline]
    pub fn new(kind: FusedKind, target: UnitId, timestamp: Instant) -> Self {
        Self { kind, target, part_id: None, timestamp }
    }

    pub fn with_part(mut self, part_id: PartId) -> Self {
        self.part_id = Some(part_id);
        self
    }

    #[inline]
    pub fn is_alert(&self) -> bool {
        self.kind.is_alert()
    }
}

/// Milliseconds helper for logging durations
#[inline]
pub fn as_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_display() {
        assert_eq!(UnitId::Station(StationId(2)).to_string(), "S2");
        assert_eq!(UnitId::Corner(CornerId(4)).to_string(), "C4");
        assert_eq!(MotorId(7).to_string(), "M7");
    }

    #[test]
    fn test_part_id_from_uid() {
        let part = PartId::from_uid(&[0x04, 0xa1, 0xb2, 0xc3]);
        assert_eq!(part.as_str(), "04a1b2c3");
    }

    #[test]
    fn test_alert_kinds() {
        assert!(FusedKind::PartUnidentified.is_alert());
        assert!(FusedKind::GhostTagRead.is_alert());
        assert!(FusedKind::ProcessStalled.is_alert());
        assert!(!FusedKind::PartIdentified.is_alert());
        assert!(!FusedKind::CornerHandshakeConfirmed.is_alert());
    }
}
