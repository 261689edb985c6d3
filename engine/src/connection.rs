//! State owned by a single client connection.

use log::{debug, error, warn};
use protocol::{BlockPos, Confirmation, ConfirmationStyle, PacketRecord, VersionLayout};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{EngineConfig, IdRange, PredictionCatalogue};
use crate::error::Anomaly;
use crate::tracker::{PredictionTracker, Tick, TrackedObject};

pub type ConnectionId = u64;

const RECENT_ANOMALIES: usize = 16;

/// Probes the client has not answered yet. Beyond this the oldest is
/// forgotten and its tracked objects are left to expire.
const MAX_OUTSTANDING_PROBES: usize = 256;

/// Counters kept per connection. Returned to the adapter on disconnect.
///
/// Packet counters cover every frame handed to the tap while the connection
/// was open; the remaining counters follow tracked objects and anomalies.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Frames received from the client.
    pub packets_in: u64,
    /// Frames sent to the client.
    pub packets_out: u64,
    /// Frames decoded as one of the recognized packets.
    pub recognized: u64,
    /// Frames forwarded unchanged.
    pub passed: u64,
    /// Frames forwarded with a rewritten body.
    pub replaced: u64,
    /// Frames dropped.
    pub cancelled: u64,
    /// Positions armed by a predictable block change.
    pub armed: u64,
    /// Armed positions replaced by a newer block change before confirmation.
    pub overwritten: u64,
    /// Tracked objects resolved by a confirmation reply.
    pub resolved: u64,
    /// Tracked objects whose TTL ran out.
    pub expired: u64,
    /// Tracked objects dropped because the position stopped being
    /// predictable.
    pub released: u64,
    /// Tracked objects pushed out by the per-connection capacity.
    pub evicted: u64,
    pub decode_errors: u64,
    pub encode_errors: u64,
    /// Frames seen on a connection whose protocol has no codec layout.
    pub unknown_version: u64,
    /// Failed or panicking authoritative-state queries.
    pub callback_failures: u64,
    /// Panics caught at the tap boundary.
    pub internal_faults: u64,
    /// Replies in the engine's id range that matched no outstanding probe.
    pub unexpected_confirmations: u64,
    /// Replies that skipped over earlier outstanding probes.
    pub out_of_order_confirmations: u64,
}

impl ConnectionStats {
    /// Sum of every anomaly counter.
    pub fn anomalies(&self) -> u64 {
        self.decode_errors
            + self.encode_errors
            + self.unknown_version
            + self.overwritten
            + self.callback_failures
            + self.evicted
            + self.internal_faults
            + self.unexpected_confirmations
            + self.out_of_order_confirmations
    }
}

#[derive(Debug)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub protocol_version: u32,
    /// `None` when no layout covers `protocol_version`.
    pub layout: Option<Arc<VersionLayout>>,
    pub tracker: PredictionTracker,
    /// Probe ids owned by the engine on this connection, already clamped to
    /// what the layout's confirmation style can carry.
    pub confirmation_range: Option<IdRange>,
    next_confirmation: Option<i32>,
    /// Probe ids sent to the client and not answered yet, oldest first.
    outstanding: VecDeque<i32>,
    pub now: Tick,
    pub stats: ConnectionStats,
    recent: VecDeque<Anomaly>,
    pub closed: bool,
}

impl ConnectionState {
    pub fn new(
        id: ConnectionId,
        protocol_version: u32,
        layout: Option<Arc<VersionLayout>>,
        catalogue: Arc<PredictionCatalogue>,
        config: &EngineConfig,
        now: Tick,
    ) -> Self {
        let confirmation_range = layout.as_ref().map(|layout| {
            let clamped = config.confirmation_range.clamp_to(layout.confirmation);
            if clamped != config.confirmation_range {
                warn!(
                    "Connection {}: confirmation range {} does not fit {:?} ids, using {}",
                    id, config.confirmation_range, layout.confirmation, clamped
                );
            }
            clamped
        });

        Self {
            id,
            protocol_version,
            layout,
            tracker: PredictionTracker::new(catalogue, config.max_tracked),
            confirmation_range,
            next_confirmation: None,
            outstanding: VecDeque::new(),
            now,
            stats: ConnectionStats::default(),
            recent: VecDeque::with_capacity(RECENT_ANOMALIES),
            closed: false,
        }
    }

    /// Logs and counts an anomaly. The connection keeps going regardless.
    pub fn record(&mut self, anomaly: Anomaly) {
        match &anomaly {
            Anomaly::Decode(_) => {
                self.stats.decode_errors += 1;
                warn!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::Encode(_) => {
                self.stats.encode_errors += 1;
                warn!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::UnknownProtocolVersion(_) => {
                // Already reported once at registration.
                self.stats.unknown_version += 1;
            }
            Anomaly::TrackerOverwrite { .. } => {
                self.stats.overwritten += 1;
                debug!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::HostCallbackFailure { .. } => {
                self.stats.callback_failures += 1;
                warn!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::CapacityEviction { .. } => {
                self.stats.evicted += 1;
                warn!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::UnexpectedConfirmation(_) => {
                self.stats.unexpected_confirmations += 1;
                debug!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::OutOfOrderConfirmation { .. } => {
                self.stats.out_of_order_confirmations += 1;
                warn!("Connection {}: {}", self.id, anomaly);
            }
            Anomaly::InternalFault(_) => {
                self.stats.internal_faults += 1;
                error!("Connection {}: {}", self.id, anomaly);
            }
        }

        if self.recent.len() == RECENT_ANOMALIES {
            self.recent.pop_front();
        }
        self.recent.push_back(anomaly);
    }

    /// Most recent anomalies, oldest first.
    pub fn recent_anomalies(&self) -> impl Iterator<Item = &Anomaly> {
        self.recent.iter()
    }

    pub fn owns_confirmation(&self, id: i32) -> bool {
        self.confirmation_range
            .map(|range| range.contains(id))
            .unwrap_or(false)
    }

    /// Builds the next probe for this connection, cycling through its range.
    pub fn next_probe(&mut self) -> Option<PacketRecord> {
        let layout = self.layout.as_ref()?;
        let range = self.confirmation_range?;

        let id = match self.next_confirmation {
            Some(previous) => range.step(previous),
            None => range.start,
        };
        self.next_confirmation = Some(id);

        let confirmation = match layout.confirmation {
            ConfirmationStyle::PingPong => Confirmation::Ping { id },
            ConfirmationStyle::Transaction => Confirmation::Transaction {
                window_id: 0,
                // Clamped to the transaction bounds when the range was built.
                action: id as i16,
                accepted: false,
            },
        };
        Some(PacketRecord::ConfirmProbe(confirmation))
    }

    /// Notes that probe `id` went out to the client.
    pub fn probe_sent(&mut self, id: i32) {
        if self.outstanding.len() == MAX_OUTSTANDING_PROBES {
            if let Some(dropped) = self.outstanding.pop_front() {
                debug!(
                    "Connection {}: gave up waiting for confirmation {}",
                    self.id, dropped
                );
            }
        }
        self.outstanding.push_back(id);
    }

    /// Takes the outstanding probes a reply to `id` confirms: `id` itself
    /// and every probe sent before it, oldest first. `None` when `id` is not
    /// outstanding.
    pub fn take_confirmed(&mut self, id: i32) -> Option<Vec<i32>> {
        let index = self.outstanding.iter().position(|&sent| sent == id)?;
        Some(self.outstanding.drain(..=index).collect())
    }

    pub fn outstanding_probes(&self) -> usize {
        self.outstanding.len()
    }

    /// Moves the connection's clock forward. Time never runs backwards.
    pub fn advance(&mut self, now: Tick) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn lookup(&self, position: BlockPos) -> Option<TrackedObject> {
        if self.closed {
            return None;
        }
        self.tracker.lookup(position).cloned()
    }

    /// Flushes the tracker and stops processing. Idempotent.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.outstanding.clear();
        self.tracker.flush()
    }
}

/// Per-connection lane: every packet of one connection goes through this lock
/// in arrival order.
#[derive(Debug)]
pub struct Connection {
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// A panic in one packet's handling must not wedge the connection, so a
    /// poisoned lock is taken over as is.
    pub fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ProtocolRegistry;

    fn state_for(version: u32) -> ConnectionState {
        let registry = ProtocolRegistry::standard();
        let layout = registry.layout(version).ok().cloned().map(Arc::new);
        let config = EngineConfig::default();
        ConnectionState::new(7, version, layout, Arc::new(config.catalogue()), &config, 0)
    }

    #[test]
    fn test_transaction_probes_cycle_through_range() {
        let mut state = state_for(340);
        state.confirmation_range = Some(IdRange::new(-1, -2));

        let ids: Vec<i32> = (0..3)
            .map(|_| match state.next_probe() {
                Some(PacketRecord::ConfirmProbe(Confirmation::Transaction {
                    window_id,
                    action,
                    accepted,
                })) => {
                    assert_eq!(window_id, 0);
                    assert!(!accepted);
                    i32::from(action)
                }
                other => panic!("Unexpected probe: {:?}", other),
            })
            .collect();

        assert_eq!(ids, vec![-1, -2, -1]);
    }

    #[test]
    fn test_ping_probes() {
        let mut state = state_for(763);
        match state.next_probe() {
            Some(PacketRecord::ConfirmProbe(Confirmation::Ping { id })) => assert_eq!(id, -1),
            other => panic!("Unexpected probe: {:?}", other),
        }
        assert!(state.owns_confirmation(-1));
        assert!(!state.owns_confirmation(0));
    }

    #[test]
    fn test_range_is_clamped_to_transaction_bounds() {
        let registry = ProtocolRegistry::standard();
        let layout = registry.layout(47).ok().cloned().map(Arc::new);
        let config = EngineConfig {
            confirmation_range: IdRange::new(5, -100_000),
            ..EngineConfig::default()
        };
        let state =
            ConnectionState::new(1, 47, layout, Arc::new(config.catalogue()), &config, 0);
        assert_eq!(state.confirmation_range, Some(IdRange::new(-1, -32768)));
    }

    #[test]
    fn test_unknown_version_has_no_probes() {
        let mut state = state_for(1);
        assert!(state.layout.is_none());
        assert!(state.next_probe().is_none());
        assert!(!state.owns_confirmation(-1));
    }

    #[test]
    fn test_record_counts_and_keeps_recent() {
        let mut state = state_for(763);
        for _ in 0..20 {
            state.record(Anomaly::InternalFault("boom".to_string()));
        }
        state.record(Anomaly::UnknownProtocolVersion(1));

        assert_eq!(state.stats.internal_faults, 20);
        assert_eq!(state.stats.unknown_version, 1);
        assert_eq!(state.stats.anomalies(), 21);
        assert_eq!(state.recent_anomalies().count(), RECENT_ANOMALIES);
        assert_eq!(
            state.recent_anomalies().last(),
            Some(&Anomaly::UnknownProtocolVersion(1))
        );
    }

    #[test]
    fn test_confirmed_probes_are_taken_in_send_order() {
        let mut state = state_for(763);
        for id in [-1, -2, -3, -4] {
            state.probe_sent(id);
        }

        assert_eq!(state.take_confirmed(-1), Some(vec![-1]));
        assert_eq!(state.take_confirmed(-3), Some(vec![-2, -3]));
        assert_eq!(state.take_confirmed(-3), None);
        assert_eq!(state.take_confirmed(-9), None);
        assert_eq!(state.outstanding_probes(), 1);

        state.close();
        assert_eq!(state.outstanding_probes(), 0);
    }

    #[test]
    fn test_outstanding_probes_are_bounded() {
        let mut state = state_for(763);
        for id in 0..(MAX_OUTSTANDING_PROBES as i32 + 10) {
            state.probe_sent(id);
        }
        assert_eq!(state.outstanding_probes(), MAX_OUTSTANDING_PROBES);
        assert_eq!(state.take_confirmed(5), None);
        assert_eq!(state.take_confirmed(10).map(|ids| ids.len()), Some(1));
    }

    #[test]
    fn test_clock_never_runs_backwards() {
        let mut state = state_for(763);
        state.advance(10);
        state.advance(4);
        assert_eq!(state.now, 10);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let connection = Arc::new(Connection::new(state_for(763)));
        let clone = Arc::clone(&connection);
        let result = std::thread::spawn(move || {
            let _guard = clone.lock();
            panic!("poison");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(connection.lock().id, 7);
    }
}
