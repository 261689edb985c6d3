//! Per-connection table of objects inside their divergence-correction window.
//!
//! Each connection owns exactly one tracker. An entry is armed when the
//! server sends the client a state the client predicts locally, and leaves
//! the table either when the client confirms it has caught up (resolved) or
//! when its TTL runs out (expired).
//!
//! Expiry is two-step. A sweep at tick `T` pulls due entries out of the
//! active table, so `lookup` stops seeing them at once, but keeps them as
//! *lapsed* until a sweep at a later tick. A confirmation that arrives while
//! the connection is still at `T` resolves a lapsed entry, which gives
//! resolution precedence over expiry within the same tick.

use protocol::{BlockPos, BlockState};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ObjectKind, PredictionCatalogue};

/// Discrete host time unit.
pub type Tick = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedObject {
    pub position: BlockPos,
    pub kind: ObjectKind,
    /// State the client is currently rendering at `position`.
    pub predicted: BlockState,
    pub created_at: Tick,
    pub expires_at: Tick,
    /// Probe id whose reply resolves this entry, once one has been sent.
    pub confirmation: Option<i32>,
}

impl TrackedObject {
    pub fn is_due(&self, now: Tick) -> bool {
        self.expires_at <= now
    }

    pub fn ttl(&self) -> Tick {
        self.expires_at - self.created_at
    }
}

/// Result of arming a position.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Earlier entry at the same position, discarded.
    pub replaced: Option<TrackedObject>,
    /// Entry pushed out to stay within capacity.
    pub evicted: Option<TrackedObject>,
}

/// Result of a sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sweep {
    /// Entries whose TTL ran out at this sweep.
    pub lapsed: usize,
    /// Entries from earlier sweeps that were never confirmed.
    pub expired: Vec<TrackedObject>,
}

#[derive(Debug, Clone)]
struct Lapsed {
    object: TrackedObject,
    lapsed_at: Tick,
}

#[derive(Debug)]
pub struct PredictionTracker {
    catalogue: Arc<PredictionCatalogue>,
    active: HashMap<BlockPos, TrackedObject>,
    lapsed: Vec<Lapsed>,
    capacity: usize,
}

impl PredictionTracker {
    pub fn new(catalogue: Arc<PredictionCatalogue>, capacity: usize) -> Self {
        Self {
            catalogue,
            active: HashMap::new(),
            lapsed: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Arms `position` with the TTL of `kind`. Any previous entry at the same
    /// position is replaced: the client predicts off its latest interaction.
    pub fn insert(
        &mut self,
        position: BlockPos,
        kind: ObjectKind,
        predicted: BlockState,
        now: Tick,
    ) -> Insertion {
        let ttl = self.catalogue.ttl(kind);
        let object = TrackedObject {
            position,
            kind,
            predicted,
            created_at: now,
            expires_at: now.saturating_add(ttl),
            confirmation: None,
        };

        self.lapsed.retain(|l| l.object.position != position);

        let evicted = if !self.active.contains_key(&position) && self.active.len() >= self.capacity
        {
            self.evict_soonest()
        } else {
            None
        };
        let replaced = self.active.insert(position, object);

        Insertion { replaced, evicted }
    }

    fn evict_soonest(&mut self) -> Option<TrackedObject> {
        let position = self
            .active
            .values()
            .min_by_key(|o| (o.expires_at, o.created_at, o.position))
            .map(|o| o.position)?;
        self.active.remove(&position)
    }

    /// Active entry at `position`. Lapsed entries are no longer visible.
    pub fn lookup(&self, position: BlockPos) -> Option<&TrackedObject> {
        self.active.get(&position)
    }

    /// Removes the entry at `position` because the client confirmed it. An
    /// entry that lapsed at `now` is still eligible.
    pub fn resolve(&mut self, position: BlockPos, now: Tick) -> Option<TrackedObject> {
        if let Some(object) = self.active.remove(&position) {
            return Some(object);
        }
        self.rescue(now, |o| o.position == position).pop()
    }

    /// Drops the entry at `position` without it reaching either terminal
    /// state, e.g. when the object was replaced by something unpredictable.
    pub fn release(&mut self, position: BlockPos) -> Option<TrackedObject> {
        self.active.remove(&position)
    }

    /// Attaches probe `id` to every active entry still waiting for one.
    /// Returns how many entries were bound.
    pub fn bind_confirmation(&mut self, id: i32) -> usize {
        let mut bound = 0;
        for object in self.active.values_mut() {
            if object.confirmation.is_none() {
                object.confirmation = Some(id);
                bound += 1;
            }
        }
        bound
    }

    /// Resolves every entry bound to probe `id`, including entries that
    /// lapsed at `now`.
    pub fn resolve_confirmation(&mut self, id: i32, now: Tick) -> Vec<TrackedObject> {
        let positions: Vec<BlockPos> = self
            .active
            .values()
            .filter(|o| o.confirmation == Some(id))
            .map(|o| o.position)
            .collect();

        let mut resolved: Vec<TrackedObject> = positions
            .into_iter()
            .filter_map(|position| self.active.remove(&position))
            .collect();
        resolved.extend(self.rescue(now, |o| o.confirmation == Some(id)));
        resolved.sort_by_key(|o| o.position);
        resolved
    }

    fn rescue<F>(&mut self, now: Tick, mut matches: F) -> Vec<TrackedObject>
    where
        F: FnMut(&TrackedObject) -> bool,
    {
        let mut rescued = Vec::new();
        self.lapsed.retain(|l| {
            if l.lapsed_at == now && matches(&l.object) {
                rescued.push(l.object.clone());
                false
            } else {
                true
            }
        });
        rescued
    }

    /// Removes every entry with `created_at + ttl <= now` from the active
    /// table, and finalizes entries that lapsed at an earlier tick.
    pub fn sweep(&mut self, now: Tick) -> Sweep {
        let mut expired = Vec::new();
        self.lapsed.retain(|l| {
            if l.lapsed_at < now {
                expired.push(l.object.clone());
                false
            } else {
                true
            }
        });

        let due: Vec<BlockPos> = self
            .active
            .values()
            .filter(|o| o.is_due(now))
            .map(|o| o.position)
            .collect();
        let lapsed = due.len();
        for position in due {
            if let Some(object) = self.active.remove(&position) {
                self.lapsed.push(Lapsed {
                    object,
                    lapsed_at: now,
                });
            }
        }

        expired.sort_by_key(|o| o.position);
        Sweep { lapsed, expired }
    }

    /// Empties the tracker. Returns how many entries were still active.
    pub fn flush(&mut self) -> usize {
        let active = self.active.len();
        self.active.clear();
        self.lapsed.clear();
        active
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Entries that lapsed at the latest sweep and can still be resolved.
    pub fn lapsed_len(&self) -> usize {
        self.lapsed.len()
    }

    /// Active entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedObject> {
        self.active.values()
    }
}
