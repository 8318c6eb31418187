//! Bounded raw-event queues, one per producer class
//!
//! Producers call `enqueue` from any thread; it never blocks beyond the
//! queue's own short critical section. A full queue applies the configured
//! overflow policy and counts the drop. The CEP consumer is the only reader
//! and waits on a `Notify` shared by every queue in the set.

use crate::domain::topology::{ChannelSpec, Topology};
use crate::domain::types::{ChannelId, RawEvent, RawSource};
use crate::infra::config::{Config, OverflowPolicy};
use crate::infra::metrics::{Metrics, METRICS_SOURCES};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Result of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest event
    DroppedOldest,
    /// Not queued, queue full
    Rejected,
}

pub struct EventQueue {
    name: String,
    source: RawSource,
    capacity: usize,
    policy: OverflowPolicy,
    events: Mutex<VecDeque<RawEvent>>,
    dropped: AtomicU64,
    notify: Arc<Notify>,
    metrics: Option<Arc<Metrics>>,
}

impl EventQueue {
    pub fn new(
        name: impl Into<String>,
        source: RawSource,
        capacity: usize,
        policy: OverflowPolicy,
        notify: Arc<Notify>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            source,
            capacity,
            policy,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
            notify,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add an event; never blocks the producer
    pub fn enqueue(&self, event: RawEvent) -> EnqueueOutcome {
        let outcome = {
            let mut events = self.events.lock();
            if events.len() < self.capacity {
                events.push_back(event);
                EnqueueOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        events.pop_front();
                        events.push_back(event);
                        EnqueueOutcome::DroppedOldest
                    }
                    OverflowPolicy::Reject => EnqueueOutcome::Rejected,
                }
            }
        };

        if outcome != EnqueueOutcome::Rejected {
            self.notify.notify_one();
        }
        if outcome != EnqueueOutcome::Queued {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(ref metrics) = self.metrics {
                metrics.record_dropped(self.source);
            }
            warn!(
                queue = %self.name,
                capacity = %self.capacity,
                policy = ?self.policy,
                dropped_total = %dropped,
                "queue_overflow"
            );
        }
        outcome
    }

    /// Pop the oldest event without waiting
    #[inline]
    pub fn try_dequeue(&self) -> Option<RawEvent> {
        self.events.lock().pop_front()
    }

    /// Wait up to `timeout` for an event
    pub async fn dequeue(&self, timeout: Duration) -> Option<RawEvent> {
        if let Some(event) = self.try_dequeue() {
            return Some(event);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.try_dequeue()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events lost to overflow since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> RawSource {
        self.source
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Throw away everything queued, returning the count
    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let n = events.len();
        events.clear();
        n
    }
}

/// All queues of the cell, read round-robin by the consumer
#[derive(Clone)]
pub struct QueueSet {
    edge: Arc<EventQueue>,
    polled: Arc<EventQueue>,
    tags: Vec<(ChannelId, Arc<EventQueue>)>,
    notify: Arc<Notify>,
    cursor: usize,
}

impl QueueSet {
    /// Build the edge and polled queues plus one queue per tag reader channel
    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::build(
            config.topology(),
            config.edge_capacity(),
            config.polled_capacity(),
            config.tag_capacity(),
            config.overflow_policy(),
            Some(metrics),
        )
    }

    pub fn build(
        topology: &Topology,
        edge_capacity: usize,
        polled_capacity: usize,
        tag_capacity: usize,
        policy: OverflowPolicy,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let make = |name: &str, source: RawSource, capacity: usize| {
            let queue = EventQueue::new(name, source, capacity, policy, notify.clone());
            match metrics {
                Some(ref m) => Arc::new(queue.with_metrics(m.clone())),
                None => Arc::new(queue),
            }
        };

        let edge = make("edge", RawSource::Edge, edge_capacity);
        let polled = make("polled", RawSource::Polled, polled_capacity);
        let mut tags: Vec<(ChannelId, Arc<EventQueue>)> = topology
            .channels()
            .filter(|c| c.source == RawSource::Tag)
            .map(|c| (c.id.clone(), make(c.id.as_str(), RawSource::Tag, tag_capacity)))
            .collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));

        Self { edge, polled, tags, notify, cursor: 0 }
    }

    /// Queue a producer for `channel` writes into
    pub fn queue_for(&self, channel: &ChannelSpec) -> Option<Arc<EventQueue>> {
        match channel.source {
            RawSource::Edge => Some(self.edge.clone()),
            RawSource::Polled => Some(self.polled.clone()),
            RawSource::Tag => {
                self.tags.iter().find(|(id, _)| *id == channel.id).map(|(_, q)| q.clone())
            }
        }
    }

    /// Route an event to its producer-class queue (used by scripted feeds and tests)
    pub fn enqueue(&self, event: RawEvent) -> EnqueueOutcome {
        match event.source {
            RawSource::Edge => self.edge.enqueue(event),
            RawSource::Polled => self.polled.enqueue(event),
            RawSource::Tag => {
                match self.tags.iter().find(|(id, _)| *id == event.channel) {
                    Some((_, q)) => q.enqueue(event),
                    None => {
                        warn!(channel = %event.channel, "tag_event_for_unknown_reader");
                        EnqueueOutcome::Rejected
                    }
                }
            }
        }
    }

    fn queue_at(&self, index: usize) -> &Arc<EventQueue> {
        match index {
            0 => &self.edge,
            1 => &self.polled,
            n => &self.tags[n - 2].1,
        }
    }

    fn queue_count(&self) -> usize {
        2 + self.tags.len()
    }

    /// Pop one event, rotating the starting queue so no class starves
    pub fn try_pop(&mut self) -> Option<RawEvent> {
        let n = self.queue_count();
        for offset in 0..n {
            let index = (self.cursor + offset) % n;
            if let Some(event) = self.queue_at(index).try_dequeue() {
                self.cursor = (index + 1) % n;
                return Some(event);
            }
        }
        None
    }

    /// Wait up to `timeout` for an event from any queue
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<RawEvent> {
        if let Some(event) = self.try_pop() {
            return Some(event);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.try_pop()
    }

    pub fn total_len(&self) -> usize {
        (0..self.queue_count()).map(|i| self.queue_at(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Drop everything still queued, returning the count
    pub fn discard_all(&self) -> usize {
        (0..self.queue_count()).map(|i| self.queue_at(i).clear()).sum()
    }

    /// Queue depth per producer class, in `RawSource::index()` order
    pub fn depth_by_source(&self) -> [u64; 3] {
        let mut depth = [0u64; 3];
        for i in 0..self.queue_count() {
            let q = self.queue_at(i);
            depth[q.source().index()] += q.len() as u64;
        }
        depth
    }

    /// Push current depths into the metrics gauges
    pub fn sample_depths(&self, metrics: &Metrics) {
        let depth = self.depth_by_source();
        for source in METRICS_SOURCES {
            metrics.set_queue_depth(source, depth[source.index()]);
        }
    }

    pub fn dropped_total(&self) -> u64 {
        (0..self.queue_count()).map(|i| self.queue_at(i).dropped()).sum()
    }
}
