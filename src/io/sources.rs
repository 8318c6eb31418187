//! Producer adapters: sensor and NFC sources feeding the raw-event queues
//!
//! Hardware reads are blocking, so each producer runs on its own blocking
//! task, stamps events with `Instant::now()` and writes only to its own queue.

use crate::domain::types::{ChannelId, PartId, RawEvent, RawPayload, RawSource};
use crate::io::queue::{EnqueueOutcome, EventQueue};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed hardware read
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A tag left on a reader is reported once per this interval
const TAG_REPEAT_SUPPRESSION: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Level(bool),
    Analog(f64),
}

/// One reading from an edge or polled sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub channel: ChannelId,
    pub value: SensorValue,
}

impl SensorReading {
    pub fn level(channel: &str, level: bool) -> Self {
        Self { channel: ChannelId::new(channel), value: SensorValue::Level(level) }
    }
}

/// Edge-interrupt or polled sensor hardware
pub trait SensorSource: Send {
    /// Wait up to `timeout` for the next reading
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<SensorReading>>;
}

/// NFC reader hardware
pub trait NfcSource: Send {
    /// Wait up to `timeout` for a tag; returns its raw UID
    fn read_tag(&mut self, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Source that never produces anything (simulation without a script)
#[derive(Debug, Default)]
pub struct IdleSource;

impl SensorSource for IdleSource {
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<SensorReading>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

impl NfcSource for IdleSource {
    fn read_tag(&mut self, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

/// Channel-fed source for bench runs and tests
pub struct Scripted<T> {
    rx: std_mpsc::Receiver<T>,
}

/// Create a scripted source and the handle that feeds it
pub fn scripted<T>() -> (std_mpsc::Sender<T>, Scripted<T>) {
    let (tx, rx) = std_mpsc::channel();
    (tx, Scripted { rx })
}

impl<T> Scripted<T> {
    fn next(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(std_mpsc::RecvTimeoutError::Timeout) => None,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                // Script finished; behave like idle hardware
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

impl SensorSource for Scripted<SensorReading> {
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<SensorReading>> {
        Ok(self.next(timeout))
    }
}

impl NfcSource for Scripted<Vec<u8>> {
    fn read_tag(&mut self, timeout: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.next(timeout))
    }
}

/// Wrap a sensor reading into a raw event
fn to_raw(class: RawSource, reading: SensorReading, timestamp: Instant) -> RawEvent {
    let payload = match reading.value {
        SensorValue::Level(level) => RawPayload::Edge(level),
        SensorValue::Analog(v) => RawPayload::Analog(v),
    };
    RawEvent { source: class, channel: reading.channel, payload, timestamp }
}

/// Run a sensor producer on a blocking task until shutdown
///
/// Returns the number of events enqueued.
pub fn spawn_sensor_producer(
    mut source: Box<dyn SensorSource>,
    class: RawSource,
    queue: Arc<EventQueue>,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::task::spawn_blocking(move || {
        info!(class = %class.as_str(), queue = %queue.name(), "sensor_producer_started");
        let mut produced = 0u64;
        while !*shutdown.borrow() {
            match source.poll(poll_timeout) {
                Ok(Some(reading)) => {
                    let event = to_raw(class, reading, Instant::now());
                    if queue.enqueue(event) != EnqueueOutcome::Rejected {
                        produced += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(class = %class.as_str(), error = %format!("{:#}", e), "sensor_read_failed");
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        info!(class = %class.as_str(), produced = %produced, "sensor_producer_stopped");
        produced
    })
}

/// Run an NFC reader producer on a blocking task until shutdown
///
/// UIDs become hex part ids; a tag resting on the reader is not re-reported
/// until it has been away for the suppression interval.
pub fn spawn_tag_producer(
    mut reader: Box<dyn NfcSource>,
    channel: ChannelId,
    queue: Arc<EventQueue>,
    read_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::task::spawn_blocking(move || {
        info!(channel = %channel, "tag_producer_started");
        let mut produced = 0u64;
        let mut last: Option<(PartId, Instant)> = None;
        while !*shutdown.borrow() {
            match reader.read_tag(read_timeout) {
                Ok(Some(uid)) => {
                    let now = Instant::now();
                    let part_id = PartId::from_uid(&uid);
                    let repeat = matches!(
                        last,
                        Some((ref prev, at)) if *prev == part_id
                            && now.duration_since(at) < TAG_REPEAT_SUPPRESSION
                    );
                    last = Some((part_id.clone(), now));
                    if repeat {
                        debug!(channel = %channel, part_id = %part_id, "tag_repeat_suppressed");
                        continue;
                    }
                    let event = RawEvent::tag(channel.as_str(), part_id, now);
                    if queue.enqueue(event) != EnqueueOutcome::Rejected {
                        produced += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(channel = %channel, error = %format!("{:#}", e), "tag_read_failed");
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        info!(channel = %channel, produced = %produced, "tag_producer_stopped");
        produced
    })
}
