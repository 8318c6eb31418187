//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::RawSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Fusion latency bucket boundaries (milliseconds between the two halves)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000 ms
const FUSION_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Number of producer classes (edge, polled, tag)
const NUM_SOURCES: usize = 3;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn fusion_bucket_index(latency_ms: u64) -> usize {
    FUSION_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

#[inline]
fn load_all<const N: usize>(counters: &[AtomicU64; N]) -> [u64; N] {
    std::array::from_fn(|i| counters[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Raw events dequeued by the consumer, per producer class (monotonic)
    raw_events_total: [AtomicU64; NUM_SOURCES],
    /// Raw events dequeued since last report (reset on report)
    events_since_report: AtomicU64,
    /// Raw events dropped on queue overflow, per producer class (monotonic)
    dropped_total: [AtomicU64; NUM_SOURCES],
    /// Current queue depth per producer class (updated by sampler)
    queue_depth: [AtomicU64; NUM_SOURCES],
    /// Fused events emitted, alerts included (monotonic)
    fused_total: AtomicU64,
    /// Entry edges that expired without a tag read (monotonic)
    unidentified_total: AtomicU64,
    /// Tag reads that expired without an entry edge (monotonic)
    ghost_total: AtomicU64,
    /// Process correlations that expired without a falling edge (monotonic)
    stalled_total: AtomicU64,
    /// Sum of delivery latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max delivery latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Delivery latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Deliveries since last report (reset on report)
    deliveries_since_report: AtomicU64,
    /// Fusion latency histogram buckets in ms (cumulative)
    fusion_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of fusion latencies in ms (cumulative)
    fusion_sum_ms: AtomicU64,
    /// Events rejected by a controller (monotonic)
    rejected_total: AtomicU64,
    /// Alerts raised anywhere in the core (monotonic)
    alerts_total: AtomicU64,
    /// Corner handshake timeouts (monotonic)
    handshake_timeouts_total: AtomicU64,
    /// Corner requests refused by the collision manager (monotonic)
    corner_refusals_total: AtomicU64,
    /// Actuator commands that reported failure (monotonic)
    actuator_failures_total: AtomicU64,
    /// Telemetry messages dropped due to channel full (monotonic)
    telemetry_dropped_total: AtomicU64,
    /// Corners currently occupied (updated by health monitor)
    corners_occupied: AtomicU64,
    /// Corners currently awaiting a handshake (updated by health monitor)
    corners_awaiting: AtomicU64,
    /// Parts identified but not yet exited (updated by the consumer sweep)
    parts_in_progress: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            raw_events_total: std::array::from_fn(|_| AtomicU64::new(0)),
            events_since_report: AtomicU64::new(0),
            dropped_total: std::array::from_fn(|_| AtomicU64::new(0)),
            queue_depth: std::array::from_fn(|_| AtomicU64::new(0)),
            fused_total: AtomicU64::new(0),
            unidentified_total: AtomicU64::new(0),
            ghost_total: AtomicU64::new(0),
            stalled_total: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            deliveries_since_report: AtomicU64::new(0),
            fusion_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fusion_sum_ms: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            alerts_total: AtomicU64::new(0),
            handshake_timeouts_total: AtomicU64::new(0),
            corner_refusals_total: AtomicU64::new(0),
            actuator_failures_total: AtomicU64::new(0),
            telemetry_dropped_total: AtomicU64::new(0),
            corners_occupied: AtomicU64::new(0),
            corners_awaiting: AtomicU64::new(0),
            parts_in_progress: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a raw event dequeued by the consumer
    #[inline]
    pub fn record_raw_event(&self, source: RawSource) {
        self.raw_events_total[source.index()].fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a raw event dropped on queue overflow
    #[inline]
    pub fn record_dropped(&self, source: RawSource) {
        self.dropped_total[source.index()].fetch_add(1, Ordering::Relaxed);
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_queue_depth(&self, source: RawSource, depth: u64) {
        self.queue_depth[source.index()].store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn queue_depth(&self, source: RawSource) -> u64 {
        self.queue_depth[source.index()].load(Ordering::Relaxed)
    }

    /// Record a completed correlation and the span between its two halves
    #[inline]
    pub fn record_fusion(&self, latency_ms: u64) {
        self.fused_total.fetch_add(1, Ordering::Relaxed);
        self.fusion_buckets[fusion_bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.fusion_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Record a fused event that needed no correlation
    #[inline]
    pub fn record_direct_fused(&self) {
        self.fused_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unidentified(&self) {
        self.unidentified_total.fetch_add(1, Ordering::Relaxed);
        self.fused_total.fetch_add(1, Ordering::Relaxed);
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ghost(&self) {
        self.ghost_total.fetch_add(1, Ordering::Relaxed);
        self.fused_total.fetch_add(1, Ordering::Relaxed);
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stalled(&self) {
        self.stalled_total.fetch_add(1, Ordering::Relaxed);
        self.fused_total.fetch_add(1, Ordering::Relaxed);
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fused event delivered to its controller with given latency (lock-free)
    #[inline]
    pub fn record_delivery(&self, latency_us: u64) {
        self.deliveries_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    /// Record an event rejected as invalid for the controller's state
    #[inline]
    pub fn record_rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an alert that has no more specific counter
    #[inline]
    pub fn record_alert(&self) {
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handshake_timeout(&self) {
        self.handshake_timeouts_total.fetch_add(1, Ordering::Relaxed);
        self.alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_corner_refusal(&self) {
        self.corner_refusals_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_actuator_failure(&self) {
        self.actuator_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_telemetry_dropped(&self) {
        self.telemetry_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set corner gauges (called by health monitor)
    #[inline]
    pub fn set_corner_gauges(&self, occupied: u64, awaiting: u64) {
        self.corners_occupied.store(occupied, Ordering::Relaxed);
        self.corners_awaiting.store(awaiting, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_parts_in_progress(&self, parts: usize) {
        self.parts_in_progress.store(parts as u64, Ordering::Relaxed);
    }

    pub fn parts_in_progress(&self) -> usize {
        self.parts_in_progress.load(Ordering::Relaxed) as usize
    }

    pub fn raw_events_total(&self) -> u64 {
        self.raw_events_total.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn dropped_total(&self, source: RawSource) -> u64 {
        self.dropped_total[source.index()].load(Ordering::Relaxed)
    }

    pub fn fused_total(&self) -> u64 {
        self.fused_total.load(Ordering::Relaxed)
    }

    pub fn unidentified_total(&self) -> u64 {
        self.unidentified_total.load(Ordering::Relaxed)
    }

    pub fn ghost_total(&self) -> u64 {
        self.ghost_total.load(Ordering::Relaxed)
    }

    pub fn stalled_total(&self) -> u64 {
        self.stalled_total.load(Ordering::Relaxed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn alerts_total(&self) -> u64 {
        self.alerts_total.load(Ordering::Relaxed)
    }

    pub fn handshake_timeouts_total(&self) -> u64 {
        self.handshake_timeouts_total.load(Ordering::Relaxed)
    }

    pub fn corner_refusals_total(&self) -> u64 {
        self.corner_refusals_total.load(Ordering::Relaxed)
    }

    pub fn actuator_failures_total(&self) -> u64 {
        self.actuator_failures_total.load(Ordering::Relaxed)
    }

    pub fn telemetry_dropped_total(&self) -> u64 {
        self.telemetry_dropped_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, parts_in_progress: usize) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let deliveries = self.deliveries_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if deliveries > 0 { latency_sum / deliveries } else { 0 };

        let fusion_buckets = load_all(&self.fusion_buckets);
        let fusion_count: u64 = fusion_buckets.iter().sum();
        let fusion_sum = self.fusion_sum_ms.load(Ordering::Relaxed);
        let fusion_avg_ms = if fusion_count > 0 { fusion_sum / fusion_count } else { 0 };

        let raw_by_source = load_all(&self.raw_events_total);
        let raw_events_total = raw_by_source.iter().sum();
        let fused_total = self.fused_total.load(Ordering::Relaxed);
        let unidentified_total = self.unidentified_total.load(Ordering::Relaxed);
        let ghost_total = self.ghost_total.load(Ordering::Relaxed);
        let stalled_total = self.stalled_total.load(Ordering::Relaxed);
        let expired = unidentified_total + ghost_total + stalled_total;
        let fusion_rate = if fused_total > 0 {
            (fused_total - expired.min(fused_total)) as f64 / fused_total as f64
        } else {
            0.0
        };

        MetricsSummary {
            raw_events_total,
            raw_by_source,
            events_per_sec,
            dropped_by_source: load_all(&self.dropped_total),
            queue_depth: load_all(&self.queue_depth),
            fused_total,
            unidentified_total,
            ghost_total,
            stalled_total,
            fusion_rate,
            fusion_buckets,
            fusion_avg_ms,
            deliveries,
            avg_delivery_latency_us: avg_latency,
            max_delivery_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            alerts_total: self.alerts_total.load(Ordering::Relaxed),
            handshake_timeouts_total: self.handshake_timeouts_total.load(Ordering::Relaxed),
            corner_refusals_total: self.corner_refusals_total.load(Ordering::Relaxed),
            actuator_failures_total: self.actuator_failures_total.load(Ordering::Relaxed),
            telemetry_dropped_total: self.telemetry_dropped_total.load(Ordering::Relaxed),
            corners_occupied: self.corners_occupied.load(Ordering::Relaxed),
            corners_awaiting: self.corners_awaiting.load(Ordering::Relaxed),
            parts_in_progress,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_FUSION_BOUNDS: [u64; 10] = FUSION_BOUNDS;

/// Producer classes in counter index order
pub const METRICS_SOURCES: [RawSource; NUM_SOURCES] =
    [RawSource::Edge, RawSource::Polled, RawSource::Tag];

#[derive(Debug)]
pub struct MetricsSummary {
    pub raw_events_total: u64,
    /// Indexed by `RawSource::index()`
    pub raw_by_source: [u64; NUM_SOURCES],
    pub events_per_sec: f64,
    pub dropped_by_source: [u64; NUM_SOURCES],
    pub queue_depth: [u64; NUM_SOURCES],
    pub fused_total: u64,
    pub unidentified_total: u64,
    pub ghost_total: u64,
    pub stalled_total: u64,
    /// Share of fused events that were not expiry alerts
    pub fusion_rate: f64,
    /// Fusion latency histogram buckets (ms)
    /// Bounds: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000 ms
    pub fusion_buckets: [u64; NUM_BUCKETS],
    pub fusion_avg_ms: u64,
    pub deliveries: u64,
    pub avg_delivery_latency_us: u64,
    pub max_delivery_latency_us: u64,
    /// Delivery latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub rejected_total: u64,
    pub alerts_total: u64,
    pub handshake_timeouts_total: u64,
    pub corner_refusals_total: u64,
    pub actuator_failures_total: u64,
    pub telemetry_dropped_total: u64,
    pub corners_occupied: u64,
    pub corners_awaiting: u64,
    pub parts_in_progress: usize,
}

impl MetricsSummary {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_by_source.iter().sum()
    }

    pub fn log(&self) {
        info!(
            raw_events = %self.raw_events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            fused = %self.fused_total,
            unidentified = %self.unidentified_total,
            ghost = %self.ghost_total,
            stalled = %self.stalled_total,
            fusion_rate = format!("{:.2}", self.fusion_rate),
            fusion_avg_ms = %self.fusion_avg_ms,
            avg_latency_us = %self.avg_delivery_latency_us,
            p99_us = %self.lat_p99_us,
            rejected = %self.rejected_total,
            alerts = %self.alerts_total,
            dropped = %self.dropped_total(),
            handshake_timeouts = %self.handshake_timeouts_total,
            parts = %self.parts_in_progress,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.raw_events_total(), 0);
        assert_eq!(metrics.fused_total(), 0);
    }

    #[test]
    fn test_record_raw_events_per_source() {
        let metrics = Metrics::new();
        metrics.record_raw_event(RawSource::Edge);
        metrics.record_raw_event(RawSource::Edge);
        metrics.record_raw_event(RawSource::Tag);

        let summary = metrics.report(0);
        assert_eq!(summary.raw_events_total, 3);
        assert_eq!(summary.raw_by_source, [2, 0, 1]);
    }

    #[test]
    fn test_drops_count_as_alerts() {
        let metrics = Metrics::new();
        metrics.record_dropped(RawSource::Polled);
        assert_eq!(metrics.dropped_total(RawSource::Polled), 1);
        assert_eq!(metrics.dropped_total(RawSource::Edge), 0);
        assert_eq!(metrics.alerts_total(), 1);
    }

    #[test]
    fn test_report_resets_periodic() {
        let metrics = Metrics::new();
        metrics.record_delivery(100);
        metrics.record_delivery(200);
        metrics.record_delivery(300);

        let summary = metrics.report(2);
        assert_eq!(summary.deliveries, 3);
        assert_eq!(summary.avg_delivery_latency_us, 200);
        assert_eq!(summary.max_delivery_latency_us, 300);
        assert_eq!(summary.parts_in_progress, 2);

        assert_eq!(metrics.deliveries_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report(0);
        assert_eq!(summary.fused_total, 0);
        assert_eq!(summary.avg_delivery_latency_us, 0);
        assert_eq!(summary.fusion_rate, 0.0);
    }

    #[test]
    fn test_fusion_rate() {
        let metrics = Metrics::new();
        metrics.record_fusion(40);
        metrics.record_fusion(60);
        metrics.record_direct_fused();
        metrics.record_unidentified();

        let summary = metrics.report(0);
        assert_eq!(summary.fused_total, 4);
        assert_eq!(summary.unidentified_total, 1);
        assert!((summary.fusion_rate - 0.75).abs() < 1e-9);
        assert_eq!(summary.fusion_avg_ms, 50);
        assert_eq!(summary.fusion_buckets[3], 1); // ≤50
        assert_eq!(summary.fusion_buckets[4], 1); // ≤100
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_raw_event(RawSource::Edge);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.raw_events_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
        assert_eq!(fusion_bucket_index(5), 0);
        assert_eq!(fusion_bucket_index(6), 1);
        assert_eq!(fusion_bucket_index(9000), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_delivery(150);
        }

        let summary = metrics.report(0);
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
