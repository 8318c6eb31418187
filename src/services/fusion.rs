//! Fusion engine - turns raw events into fused domain events
//!
//! Two-way, time-windowed correlation keyed by physical zone:
//! - identification(s): entry edge + tag read at station s, either order
//! - process(s): rising + falling edge of the process sensor at station s
//!
//! Every pending correlation ends exactly once: completed by its partner
//! within the window, or expired into an alert event. A second identical half
//! supersedes the pending one, which expires immediately.
//!
//! Self-sufficient channels (exit, corner approach, conveyor start) convert
//! directly without a pending correlation.

use crate::domain::topology::{ChannelRole, ChannelSpec, Endpoint, Topology};
use crate::domain::types::{
    as_millis, ChannelId, FusedEvent, FusedKind, PartId, RawEvent, RawPayload, RawSource,
    StationId, UnitId,
};
use crate::infra::metrics::Metrics;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub type FusedBatch = SmallVec<[FusedEvent; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CorrelationKey {
    Identification(StationId),
    Process(StationId),
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationKey::Identification(s) => write!(f, "{}_identification", s),
            CorrelationKey::Process(s) => write!(f, "{}_process", s),
        }
    }
}

/// The half of a pair seen so far
#[derive(Debug, Clone, PartialEq)]
enum Half {
    Entry,
    Tag(PartId),
    ProcessRise,
}

#[derive(Debug, Clone)]
struct Pending {
    half: Half,
    created_at: Instant,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub consumed: u64,
    /// Fused events emitted (paired and direct)
    pub fused: u64,
    pub paired: u64,
    /// Entry edges that never met a tag
    pub orphaned: u64,
    pub ghost: u64,
    pub stalled: u64,
    pub ignored: u64,
}

impl FusionStats {
    /// Share of opened correlations that completed
    pub fn fusion_rate(&self) -> f64 {
        let opened = self.paired + self.orphaned + self.ghost + self.stalled;
        if opened == 0 {
            0.0
        } else {
            self.paired as f64 / opened as f64
        }
    }
}

pub struct FusionEngine {
    topology: Arc<Topology>,
    identification_window: Duration,
    process_window: Duration,
    pending: FxHashMap<CorrelationKey, Pending>,
    /// Last level of polled channels, which report samples rather than edges
    levels: FxHashMap<ChannelId, bool>,
    metrics: Option<Arc<Metrics>>,
    stats: FusionStats,
}

impl FusionEngine {
    pub fn new(
        topology: Arc<Topology>,
        identification_window: Duration,
        process_window: Duration,
    ) -> Self {
        Self {
            topology,
            identification_window,
            process_window,
            pending: FxHashMap::default(),
            levels: FxHashMap::default(),
            metrics: None,
            stats: FusionStats::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> FusionStats {
        self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: CorrelationKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Consume one raw event, returning the fused events it produces in order
    pub fn ingest(&mut self, raw: &RawEvent) -> FusedBatch {
        self.stats.consumed += 1;
        let mut out = FusedBatch::new();

        let Some(spec) = self.topology.channel(&raw.channel).cloned() else {
            warn!(channel = %raw.channel, source = %raw.source.as_str(), "unknown_channel");
            self.stats.ignored += 1;
            return out;
        };

        if let ChannelRole::TagReader(station) = spec.role {
            match &raw.payload {
                RawPayload::Tag(part_id) => self.identification_half(
                    station,
                    Half::Tag(part_id.clone()),
                    raw.timestamp,
                    &mut out,
                ),
                other => self.ignore(&spec, other),
            }
            return out;
        }

        let Some(level) = self.level_of(&spec, raw) else {
            return out;
        };
        let at = raw.timestamp;

        match spec.role {
            ChannelRole::StationEntry(s) if level => {
                if let Some(c) = self.topology.corner_delivering_to(Endpoint::Station(s)) {
                    self.direct(FusedKind::CornerHandshakeConfirmed, UnitId::Corner(c), at, &mut out);
                }
                self.direct(FusedKind::PartArrivedAtStationEntry, UnitId::Station(s), at, &mut out);
                self.identification_half(s, Half::Entry, at, &mut out);
            }
            ChannelRole::StationProcess(s) => self.process_edge(s, level, at, &mut out),
            ChannelRole::StationExit(s) if level => {
                self.direct(FusedKind::PartExitedStation, UnitId::Station(s), at, &mut out);
                if let Some(c) = self.topology.corner_fed_from(Endpoint::Station(s)) {
                    self.direct(FusedKind::CornerApproachDetected, UnitId::Corner(c), at, &mut out);
                }
            }
            ChannelRole::CornerApproach(c) if level => {
                self.direct(FusedKind::CornerApproachDetected, UnitId::Corner(c), at, &mut out);
            }
            ChannelRole::ConveyorStart(m) if level => {
                if let Some(c) = self.topology.corner_delivering_to(Endpoint::Conveyor(m)) {
                    self.direct(FusedKind::CornerHandshakeConfirmed, UnitId::Corner(c), at, &mut out);
                }
            }
            // Falling edges of presence sensors carry no meaning here
            _ => trace!(channel = %spec.id, level = %level, "edge_not_significant"),
        }
        out
    }

    /// Expire every correlation whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> FusedBatch {
        let mut keys: SmallVec<[CorrelationKey; 4]> = self
            .pending
            .iter()
            .filter(|(_, p)| now > p.deadline)
            .map(|(k, _)| *k)
            .collect();
        keys.sort();

        let mut out = FusedBatch::new();
        for key in keys {
            if let Some(pending) = self.pending.remove(&key) {
                self.expired(key, pending, now, &mut out);
            }
        }
        out
    }

    /// Level of an edge or polled channel; `None` if the event carries nothing new
    fn level_of(&mut self, spec: &ChannelSpec, raw: &RawEvent) -> Option<bool> {
        let level = match raw.payload {
            RawPayload::Edge(level) => level,
            RawPayload::Analog(value) => value >= spec.analog_threshold,
            RawPayload::Tag(_) => {
                self.ignore(spec, &raw.payload);
                return None;
            }
        };
        // Polled channels resend the current level each sample
        if raw.source == RawSource::Polled || matches!(raw.payload, RawPayload::Analog(_)) {
            if self.levels.insert(spec.id.clone(), level) == Some(level) {
                return None;
            }
        }
        Some(level)
    }

    fn ignore(&mut self, spec: &ChannelSpec, payload: &RawPayload) {
        warn!(channel = %spec.id, role = ?spec.role, payload = ?payload, "payload_role_mismatch");
        self.stats.ignored += 1;
    }

    fn direct(&mut self, kind: FusedKind, target: UnitId, at: Instant, out: &mut FusedBatch) {
        self.stats.fused += 1;
        if let Some(ref m) = self.metrics {
            m.record_direct_fused();
        }
        out.push(FusedEvent::new(kind, target, at));
    }

    fn window(&self, key: CorrelationKey) -> Duration {
        match key {
            CorrelationKey::Identification(_) => self.identification_window,
            CorrelationKey::Process(_) => self.process_window,
        }
    }

    /// Take the pending entry for `key` if it is still inside its window at `at`;
    /// a stale one is expired first so it can never also complete
    fn take_live(
        &mut self,
        key: CorrelationKey,
        at: Instant,
        out: &mut FusedBatch,
    ) -> Option<Pending> {
        let pending = self.pending.remove(&key)?;
        if at > pending.deadline {
            self.expired(key, pending, at, out);
            return None;
        }
        Some(pending)
    }

    fn open(&mut self, key: CorrelationKey, half: Half, at: Instant) {
        trace!(key = %key, half = ?half, "correlation_opened");
        let deadline = at + self.window(key);
        self.pending.insert(key, Pending { half, created_at: at, deadline });
    }

    fn completed(&mut self, pending: &Pending, at: Instant) {
        let latency = at.saturating_duration_since(pending.created_at);
        self.stats.fused += 1;
        self.stats.paired += 1;
        if let Some(ref m) = self.metrics {
            m.record_fusion(as_millis(latency));
        }
    }

    fn identification_half(&mut self, s: StationId, half: Half, at: Instant, out: &mut FusedBatch) {
        let key = CorrelationKey::Identification(s);
        let Some(pending) = self.take_live(key, at, out) else {
            self.open(key, half, at);
            return;
        };

        let part_id = match (&pending.half, &half) {
            (Half::Entry, Half::Tag(p)) | (Half::Tag(p), Half::Entry) => p.clone(),
            _ => {
                // Same half twice: the older one can no longer pair
                debug!(key = %key, "correlation_superseded");
                self.expired(key, pending, at, out);
                self.open(key, half, at);
                return;
            }
        };

        self.completed(&pending, at);
        debug!(
            station = %s,
            part_id = %part_id,
            latency_ms = %as_millis(at.saturating_duration_since(pending.created_at)),
            "part_identified"
        );
        out.push(
            FusedEvent::new(FusedKind::PartIdentified, UnitId::Station(s), at).with_part(part_id),
        );
    }

    fn process_edge(&mut self, s: StationId, rising: bool, at: Instant, out: &mut FusedBatch) {
        let key = CorrelationKey::Process(s);
        let pending = self.take_live(key, at, out);
        match (pending, rising) {
            (None, true) => self.open(key, Half::ProcessRise, at),
            (Some(pending), true) => {
                debug!(key = %key, "correlation_superseded");
                self.expired(key, pending, at, out);
                self.open(key, Half::ProcessRise, at);
            }
            (Some(pending), false) => {
                self.completed(&pending, at);
                out.push(FusedEvent::new(FusedKind::ProcessComplete, UnitId::Station(s), at));
            }
            (None, false) => {
                trace!(station = %s, "process_fall_without_rise");
            }
        }
    }

    /// Turn an unmatched half into its alert event
    fn expired(&mut self, key: CorrelationKey, pending: Pending, now: Instant, out: &mut FusedBatch) {
        let (CorrelationKey::Identification(station) | CorrelationKey::Process(station)) = key;
        let kind = match pending.half {
            Half::Entry => FusedKind::PartUnidentified,
            Half::Tag(_) => FusedKind::GhostTagRead,
            Half::ProcessRise => FusedKind::ProcessStalled,
        };
        match kind {
            FusedKind::PartUnidentified => {
                self.stats.orphaned += 1;
                if let Some(ref m) = self.metrics {
                    m.record_unidentified();
                }
            }
            FusedKind::GhostTagRead => {
                self.stats.ghost += 1;
                if let Some(ref m) = self.metrics {
                    m.record_ghost();
                }
            }
            _ => {
                self.stats.stalled += 1;
                if let Some(ref m) = self.metrics {
                    m.record_stalled();
                }
            }
        }

        warn!(
            key = %key,
            kind = %kind.as_str(),
            age_ms = %as_millis(now.saturating_duration_since(pending.created_at)),
            "correlation_expired"
        );

        let mut event = FusedEvent::new(kind, UnitId::Station(station), now);
        if let Half::Tag(part_id) = pending.half {
            event = event.with_part(part_id);
        }
        out.push(event);
    }
}
