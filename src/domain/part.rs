//! Part data model: logical parts circulating in the loop and their history

use super::types::{PartId, UnitId};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable), used as the run id
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Activities recorded in a part's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartActivity {
    Enter,
    ProcessStart,
    ProcessEnd,
    Exit,
}

impl PartActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartActivity::Enter => "ENTER",
            PartActivity::ProcessStart => "PROCESS_START",
            PartActivity::ProcessEnd => "PROCESS_END",
            PartActivity::Exit => "EXIT",
        }
    }
}

/// Where a part currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartLocation {
    At(UnitId),
    InTransit,
}

/// One entry of a part's append-only history
#[derive(Debug, Clone, PartialEq)]
pub struct PartRecord {
    pub unit: UnitId,
    pub activity: PartActivity,
    pub at: Instant,
    pub ts: u64, // epoch ms
}

#[derive(Debug, Clone)]
pub struct Part {
    pub part_id: PartId,
    pub current_location: PartLocation,
    pub history: Vec<PartRecord>,
    pub first_seen: u64, // epoch ms
    /// Number of station visits (a part re-entering a station is recycled, not recreated)
    pub visits: u32,
}

impl Part {
    pub fn new(part_id: PartId) -> Self {
        Self {
            part_id,
            current_location: PartLocation::InTransit,
            history: Vec::with_capacity(16),
            first_seen: epoch_ms(),
            visits: 0,
        }
    }

    /// Most recent record for `unit` with `activity`
    pub fn last_record(&self, unit: UnitId, activity: PartActivity) -> Option<&PartRecord> {
        self.history.iter().rev().find(|r| r.unit == unit && r.activity == activity)
    }
}

/// All parts seen during this run; parts are never removed
#[derive(Debug, Default)]
pub struct PartRegistry {
    parts: FxHashMap<PartId, Part>,
}

impl PartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a part, creating it on first sighting
    pub fn get_or_create(&mut self, part_id: &PartId) -> &mut Part {
        self.parts.entry(part_id.clone()).or_insert_with(|| Part::new(part_id.clone()))
    }

    /// Append to a part's history and move it accordingly
    pub fn record(&mut self, part_id: &PartId, unit: UnitId, activity: PartActivity, at: Instant) {
        let part = self.get_or_create(part_id);
        part.history.push(PartRecord { unit, activity, at, ts: epoch_ms() });
        match activity {
            PartActivity::Enter => {
                part.visits += 1;
                part.current_location = PartLocation::At(unit);
            }
            PartActivity::ProcessStart | PartActivity::ProcessEnd => {
                part.current_location = PartLocation::At(unit);
            }
            PartActivity::Exit => part.current_location = PartLocation::InTransit,
        }
    }

    pub fn get(&self, part_id: &PartId) -> Option<&Part> {
        self.parts.get(part_id)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Parts currently inside a unit
    pub fn in_progress(&self) -> usize {
        self.parts.values().filter(|p| matches!(p.current_location, PartLocation::At(_))).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::StationId;

    #[test]
    fn test_uuid_v7_sortable() {
        let a = new_uuid_v7();
        let b = new_uuid_v7();
        assert_eq!(a.len(), 36);
        assert!(a <= b);
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let mut reg = PartRegistry::new();
        let p = PartId::new("P42");
        let s1 = UnitId::Station(StationId(1));
        let t0 = Instant::now();

        reg.record(&p, s1, PartActivity::Enter, t0);
        reg.record(&p, s1, PartActivity::ProcessStart, t0);
        reg.record(&p, s1, PartActivity::ProcessEnd, t0);
        reg.record(&p, s1, PartActivity::Exit, t0);

        let part = reg.get(&p).unwrap();
        let activities: Vec<_> = part.history.iter().map(|r| r.activity).collect();
        assert_eq!(
            activities,
            vec![
                PartActivity::Enter,
                PartActivity::ProcessStart,
                PartActivity::ProcessEnd,
                PartActivity::Exit
            ]
        );
        assert_eq!(part.current_location, PartLocation::InTransit);
        assert_eq!(part.visits, 1);
    }

    #[test]
    fn test_reentry_recycles_part() {
        let mut reg = PartRegistry::new();
        let p = PartId::new("P7");
        let t0 = Instant::now();
        reg.record(&p, UnitId::Station(StationId(1)), PartActivity::Enter, t0);
        reg.record(&p, UnitId::Station(StationId(1)), PartActivity::Exit, t0);
        reg.record(&p, UnitId::Station(StationId(2)), PartActivity::Enter, t0);

        assert_eq!(reg.len(), 1);
        let part = reg.get(&p).unwrap();
        assert_eq!(part.visits, 2);
        assert_eq!(part.current_location, PartLocation::At(UnitId::Station(StationId(2))));
        assert_eq!(reg.in_progress(), 1);
    }
}
