//! KPI aggregation over logged activities
//!
//! Fed by the telemetry worker from the same activity stream that goes to the
//! event log, so KPIs never touch the coordination path.

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Cycle times kept per station for the rolling average
const CYCLE_HISTORY: usize = 100;

/// Window for the event rate
const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Throughput is only meaningful after this much runtime
const THROUGHPUT_WARMUP: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BusyClock {
    busy_since: Option<Instant>,
    total_busy: Duration,
}

impl BusyClock {
    fn start(&mut self, now: Instant) {
        if self.busy_since.is_none() {
            self.busy_since = Some(now);
        }
    }

    fn stop(&mut self, now: Instant) {
        if let Some(since) = self.busy_since.take() {
            self.total_busy += now.saturating_duration_since(since);
        }
    }

    fn busy(&self, now: Instant) -> Duration {
        self.total_busy + self.busy_since.map_or(Duration::ZERO, |s| now.saturating_duration_since(s))
    }
}

#[derive(Debug, Default)]
struct StationStats {
    completed: u64,
    cycle_times: VecDeque<Duration>,
    clock: BusyClock,
}

#[derive(Debug, Default)]
struct CornerStats {
    pushes: u64,
    clock: BusyClock,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StationKpi {
    pub station: String,
    pub completed: u64,
    pub avg_cycle_s: f64,
    pub utilisation_pct: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CornerKpi {
    pub corner: String,
    pub pushes: u64,
    pub utilisation_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KpiSnapshot {
    pub total_parts: u64,
    pub throughput_per_hour: f64,
    pub current_wip: u64,
    pub max_wip: u64,
    pub event_rate_per_min: f64,
    pub runtime_s: f64,
    pub stations: Vec<StationKpi>,
    pub corners: Vec<CornerKpi>,
}

impl KpiSnapshot {
    /// Flatten into (name, value) pairs for per-KPI publishing
    pub fn as_pairs(&self) -> Vec<(String, f64)> {
        let mut pairs = vec![
            ("total_parts".to_string(), self.total_parts as f64),
            ("throughput_per_hour".to_string(), self.throughput_per_hour),
            ("current_wip".to_string(), self.current_wip as f64),
            ("max_wip".to_string(), self.max_wip as f64),
            ("event_rate_per_min".to_string(), self.event_rate_per_min),
        ];
        for s in &self.stations {
            let id = s.station.to_lowercase();
            pairs.push((format!("{}_completed", id), s.completed as f64));
            pairs.push((format!("{}_avg_cycle_s", id), s.avg_cycle_s));
            pairs.push((format!("{}_utilisation_pct", id), s.utilisation_pct));
        }
        for c in &self.corners {
            pairs.push((format!("{}_utilisation_pct", c.corner.to_lowercase()), c.utilisation_pct));
        }
        pairs
    }
}

pub struct KpiTracker {
    started_at: Instant,
    stations: FxHashMap<String, StationStats>,
    corners: FxHashMap<String, CornerStats>,
    /// (part, station) -> entry time
    entries: FxHashMap<(String, String), Instant>,
    event_times: VecDeque<Instant>,
    total_parts: u64,
    current_wip: u64,
    max_wip: u64,
}

impl KpiTracker {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            stations: FxHashMap::default(),
            corners: FxHashMap::default(),
            entries: FxHashMap::default(),
            event_times: VecDeque::new(),
            total_parts: 0,
            current_wip: 0,
            max_wip: 0,
        }
    }

    /// Account for one logged activity
    pub fn record(&mut self, unit: &str, part: Option<&str>, activity: &str, now: Instant) {
        self.event_times.push_back(now);
        while let Some(&front) = self.event_times.front() {
            if now.saturating_duration_since(front) > RATE_WINDOW {
                self.event_times.pop_front();
            } else {
                break;
            }
        }

        if unit.starts_with('S') {
            self.record_station(unit, part, activity, now);
        } else if unit.starts_with('C') {
            let corner = self.corners.entry(unit.to_string()).or_default();
            match activity {
                "PUSH_START" => corner.clock.start(now),
                "PUSH_COMPLETE" => {
                    corner.pushes += 1;
                    corner.clock.stop(now);
                }
                _ => {}
            }
        }
    }

    fn record_station(&mut self, unit: &str, part: Option<&str>, activity: &str, now: Instant) {
        let station = self.stations.entry(unit.to_string()).or_default();
        match activity {
            "ENTER" => {
                if let Some(part) = part {
                    self.entries.insert((part.to_string(), unit.to_string()), now);
                }
                self.current_wip += 1;
                self.max_wip = self.max_wip.max(self.current_wip);
                station.clock.start(now);
            }
            "EXIT" => {
                self.total_parts += 1;
                station.completed += 1;
                if let Some(part) = part {
                    if let Some(entered) = self.entries.remove(&(part.to_string(), unit.to_string())) {
                        station.cycle_times.push_back(now.saturating_duration_since(entered));
                        if station.cycle_times.len() > CYCLE_HISTORY {
                            station.cycle_times.pop_front();
                        }
                    }
                }
                self.current_wip = self.current_wip.saturating_sub(1);
                station.clock.stop(now);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self, now: Instant) -> KpiSnapshot {
        let runtime = now.saturating_duration_since(self.started_at);
        let runtime_s = runtime.as_secs_f64();
        let pct = |busy: Duration| {
            if runtime_s > 0.0 {
                busy.as_secs_f64() / runtime_s * 100.0
            } else {
                0.0
            }
        };

        let mut stations: Vec<StationKpi> = self
            .stations
            .iter()
            .map(|(id, s)| {
                let avg_cycle_s = if s.cycle_times.is_empty() {
                    0.0
                } else {
                    s.cycle_times.iter().map(Duration::as_secs_f64).sum::<f64>()
                        / s.cycle_times.len() as f64
                };
                StationKpi {
                    station: id.clone(),
                    completed: s.completed,
                    avg_cycle_s,
                    utilisation_pct: pct(s.clock.busy(now)),
                }
            })
            .collect();
        stations.sort_by(|a, b| a.station.cmp(&b.station));

        let mut corners: Vec<CornerKpi> = self
            .corners
            .iter()
            .map(|(id, c)| CornerKpi {
                corner: id.clone(),
                pushes: c.pushes,
                utilisation_pct: pct(c.clock.busy(now)),
            })
            .collect();
        corners.sort_by(|a, b| a.corner.cmp(&b.corner));

        let throughput_per_hour = if runtime > THROUGHPUT_WARMUP {
            self.total_parts as f64 / runtime_s * 3600.0
        } else {
            0.0
        };
        let window_min = runtime.min(RATE_WINDOW).as_secs_f64() / 60.0;
        let event_rate_per_min =
            if window_min > 0.0 { self.event_times.len() as f64 / window_min } else { 0.0 };

        KpiSnapshot {
            total_parts: self.total_parts,
            throughput_per_hour,
            current_wip: self.current_wip,
            max_wip: self.max_wip,
            event_rate_per_min,
            runtime_s,
            stations,
            corners,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    #[test]
    fn test_cycle_time_and_completion() {
        let t0 = Instant::now();
        let mut kpi = KpiTracker::new(t0);
        kpi.record("S1", Some("P1"), "ENTER", secs(t0, 10));
        kpi.record("S1", Some("P1"), "PROCESS_START", secs(t0, 11));
        kpi.record("S1", Some("P1"), "EXIT", secs(t0, 20));

        let snap = kpi.snapshot(secs(t0, 100));
        assert_eq!(snap.total_parts, 1);
        assert_eq!(snap.current_wip, 0);
        assert_eq!(snap.max_wip, 1);
        let s1 = &snap.stations[0];
        assert_eq!(s1.station, "S1");
        assert_eq!(s1.completed, 1);
        assert!((s1.avg_cycle_s - 10.0).abs() < 1e-9);
        assert!((s1.utilisation_pct - 10.0).abs() < 1e-9);
        assert!((snap.throughput_per_hour - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_throughput_during_warmup() {
        let t0 = Instant::now();
        let mut kpi = KpiTracker::new(t0);
        kpi.record("S1", Some("P1"), "ENTER", secs(t0, 1));
        kpi.record("S1", Some("P1"), "EXIT", secs(t0, 2));
        assert_eq!(kpi.snapshot(secs(t0, 30)).throughput_per_hour, 0.0);
    }

    #[test]
    fn test_corner_utilisation_counts_open_push() {
        let t0 = Instant::now();
        let mut kpi = KpiTracker::new(t0);
        kpi.record("C1", None, "PUSH_START", secs(t0, 0));
        kpi.record("C1", None, "PUSH_COMPLETE", secs(t0, 5));
        kpi.record("C1", None, "PUSH_START", secs(t0, 90));

        let snap = kpi.snapshot(secs(t0, 100));
        let c1 = &snap.corners[0];
        assert_eq!(c1.pushes, 1);
        assert!((c1.utilisation_pct - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_wip_tracks_parts_inside_stations() {
        let t0 = Instant::now();
        let mut kpi = KpiTracker::new(t0);
        kpi.record("S1", Some("A"), "ENTER", secs(t0, 1));
        kpi.record("S2", Some("B"), "ENTER", secs(t0, 2));
        kpi.record("S1", Some("A"), "EXIT", secs(t0, 3));

        let snap = kpi.snapshot(secs(t0, 10));
        assert_eq!(snap.current_wip, 1);
        assert_eq!(snap.max_wip, 2);
        assert_eq!(snap.total_parts, 1);
    }

    #[test]
    fn test_as_pairs_names() {
        let t0 = Instant::now();
        let mut kpi = KpiTracker::new(t0);
        kpi.record("S2", Some("P"), "ENTER", secs(t0, 1));
        let names: Vec<String> =
            kpi.snapshot(secs(t0, 2)).as_pairs().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"current_wip".to_string()));
        assert!(names.contains(&"s2_utilisation_pct".to_string()));
    }
}
