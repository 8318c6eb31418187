//! Collision manager - arbiter over the corners and conveyor segments
//!
//! Single owner of the occupancy sets behind one mutex. Corner controllers
//! call it from the consumer task; the health monitor queries it from its own
//! task. The sets themselves are never handed out, only copies.
//!
//! Invariants:
//! - a corner is in at most one of `occupied` / `awaiting`
//! - `awaiting` only holds corners that were granted (i.e. extended)

use crate::domain::topology::CornerSpec;
use crate::domain::types::{CornerId, MotorId};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why a corner request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The corner itself is already occupied or awaiting a handshake
    Busy,
    /// A mutually exclusive partner holds the shared mechanical path
    Conflict(CornerId),
    /// Released too recently
    Cooldown,
}

/// Copy of the arbiter state for health reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollisionSnapshot {
    pub occupied: Vec<CornerId>,
    pub awaiting_handshake: Vec<CornerId>,
}

#[derive(Debug, Default)]
struct Inner {
    occupied: FxHashSet<CornerId>,
    awaiting: FxHashSet<CornerId>,
    last_released: FxHashMap<CornerId, Instant>,
}

impl Inner {
    #[inline]
    fn holds(&self, id: CornerId) -> bool {
        self.occupied.contains(&id) || self.awaiting.contains(&id)
    }
}

pub struct CollisionManager {
    inner: Mutex<Inner>,
    exclusive: Vec<(CornerId, CornerId)>,
    min_reuse_interval: Duration,
    corners: Vec<CornerSpec>,
}

impl CollisionManager {
    pub fn new(
        corners: &[CornerSpec],
        exclusive: &[(CornerId, CornerId)],
        min_reuse_interval: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            exclusive: exclusive.to_vec(),
            min_reuse_interval,
            corners: corners.to_vec(),
        }
    }

    fn partners(&self, id: CornerId) -> impl Iterator<Item = CornerId> + '_ {
        self.exclusive.iter().filter_map(move |&(a, b)| {
            if a == id {
                Some(b)
            } else if b == id {
                Some(a)
            } else {
                None
            }
        })
    }

    /// Ask for exclusive use of a corner; on grant the corner becomes occupied
    pub fn request_corner(&self, id: CornerId, now: Instant) -> Result<(), Refusal> {
        let mut inner = self.inner.lock();

        if inner.holds(id) {
            return Err(Refusal::Busy);
        }
        if let Some(partner) = self.partners(id).find(|&p| inner.holds(p)) {
            debug!(corner = %id, partner = %partner, "corner_request_conflict");
            return Err(Refusal::Conflict(partner));
        }
        if let Some(&released) = inner.last_released.get(&id) {
            if now.saturating_duration_since(released) < self.min_reuse_interval {
                return Err(Refusal::Cooldown);
            }
        }

        inner.occupied.insert(id);
        debug!(corner = %id, "corner_granted");
        Ok(())
    }

    /// Remove the corner from both sets; releasing a free corner is a no-op
    pub fn release_corner(&self, id: CornerId, now: Instant) {
        let mut inner = self.inner.lock();
        let was_held = inner.occupied.remove(&id) | inner.awaiting.remove(&id);
        if was_held {
            inner.last_released.insert(id, now);
            debug!(corner = %id, "corner_released");
        }
    }

    /// Move a granted corner into the awaiting-handshake set
    pub fn mark_awaiting_handshake(&self, id: CornerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.occupied.remove(&id) {
            inner.awaiting.insert(id);
            true
        } else {
            // Never granted: keeps `awaiting` a subset of extended corners
            warn!(corner = %id, "mark_awaiting_without_grant");
            false
        }
    }

    /// False while any corner on that conveyor segment is occupied or awaiting
    pub fn is_conveyor_safe_to_stop(&self, motor: MotorId) -> bool {
        let inner = self.inner.lock();
        !self.corners.iter().any(|c| c.is_on_segment(motor) && inner.holds(c.id))
    }

    pub fn snapshot(&self) -> CollisionSnapshot {
        let inner = self.inner.lock();
        let mut occupied: Vec<CornerId> = inner.occupied.iter().copied().collect();
        let mut awaiting_handshake: Vec<CornerId> = inner.awaiting.iter().copied().collect();
        occupied.sort();
        awaiting_handshake.sort();
        CollisionSnapshot { occupied, awaiting_handshake }
    }

    /// Clear all state unless a corner is mid-handshake
    pub fn try_reset(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.awaiting.is_empty() {
            return false;
        }
        inner.occupied.clear();
        inner.last_released.clear();
        true
    }

    /// Clear all state unconditionally; returns the corners that were still held
    pub fn force_reset(&self) -> Vec<CornerId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut held: Vec<CornerId> =
            inner.occupied.drain().chain(inner.awaiting.drain()).collect();
        inner.last_released.clear();
        held.sort();
        held
    }
}
