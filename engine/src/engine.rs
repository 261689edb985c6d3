//! Engine façade shared by all connections of one host process.
//!
//! The engine owns the table of registered connections and the pieces every
//! connection reads but never writes: the protocol registry, the validated
//! configuration, the prediction catalogue and the optional state query.
//! Adapters either hold on to the [`ConnectionTap`] returned at registration
//! or route frames by connection id through [`Engine::on_packet`].

use log::{debug, info, warn};
use protocol::{BlockPos, Direction, ProtocolRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{EngineConfig, PredictionCatalogue};
use crate::connection::{Connection, ConnectionId, ConnectionState, ConnectionStats};
use crate::error::EngineError;
use crate::query::StateQuery;
use crate::tap::{self, Action, ConnectionTap};
use crate::tracker::{Tick, TrackedObject};

/// Read-only state every connection needs while handling packets.
pub(crate) struct EngineShared {
    pub(crate) registry: Arc<ProtocolRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) catalogue: Arc<PredictionCatalogue>,
    pub(crate) query: Option<Arc<dyn StateQuery>>,
}

/// Summary of one sweep across all connections.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub now: Tick,
    /// Connections swept.
    pub connections: usize,
    /// Entries whose TTL ran out at this tick.
    pub lapsed: usize,
    /// Entries finalized as expired at this tick.
    pub expired: usize,
}

pub struct Engine {
    shared: Arc<EngineShared>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    now: AtomicU64,
}

impl Engine {
    /// Builds an engine around an explicit codec registry.
    ///
    /// `query` answers authoritative-state lookups for tracked positions.
    /// Without one, every stale update to a tracked position is cancelled.
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        config: EngineConfig,
        query: Option<Arc<dyn StateQuery>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(EngineError::EmptyRegistry);
        }

        let catalogue = Arc::new(config.catalogue());
        info!(
            "Desync engine ready: {} protocol layouts, {} predictable kinds, max {} tracked per connection",
            registry.len(),
            config.kinds.len(),
            config.max_tracked
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                registry,
                config,
                catalogue,
                query,
            }),
            connections: RwLock::new(HashMap::new()),
            now: AtomicU64::new(0),
        })
    }

    /// Configuration the engine was validated with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Codec layouts shared by every connection.
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.shared.registry
    }

    /// Latest tick passed to [`tick`](Engine::tick).
    pub fn now(&self) -> Tick {
        self.now.load(Ordering::Acquire)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.read().get(&id).cloned()
    }

    /// Starts tracking a connection that negotiated `protocol_version`.
    ///
    /// Registration never fails. A version without a codec layout is reported
    /// here once; the connection's packets are then passed through and
    /// counted. Registering an id that is already live replaces the old
    /// context, which is flushed and closed.
    pub fn register_connection(&self, id: ConnectionId, protocol_version: u32) -> ConnectionTap {
        let layout = match self.shared.registry.layout(protocol_version) {
            Ok(layout) => Some(Arc::new(layout.clone())),
            Err(err) => {
                warn!(
                    "Connection {}: {}; its packets will pass through unchecked",
                    id, err
                );
                None
            }
        };

        let state = ConnectionState::new(
            id,
            protocol_version,
            layout.clone(),
            Arc::clone(&self.shared.catalogue),
            &self.shared.config,
            self.now(),
        );
        let connection = Arc::new(Connection::new(state));

        let previous = self.write().insert(id, Arc::clone(&connection));
        if let Some(previous) = previous {
            let flushed = previous.lock().close();
            info!(
                "Connection {} re-registered, dropped {} tracked objects from the old session",
                id, flushed
            );
        }

        match layout {
            Some(layout) => info!(
                "Connection {} registered with protocol {} ({})",
                id, protocol_version, layout.label
            ),
            None => info!(
                "Connection {} registered with unsupported protocol {}",
                id, protocol_version
            ),
        }

        ConnectionTap::new(id, connection, Arc::clone(&self.shared))
    }

    /// Forgets a connection. Its tracker is flushed and any tap still held
    /// for it turns into a pass-through. Returns the final statistics.
    pub fn unregister_connection(&self, id: ConnectionId) -> Option<ConnectionStats> {
        let connection = self.write().remove(&id)?;
        let mut state = connection.lock();
        let flushed = state.close();
        info!(
            "Connection {} unregistered: {} packets in, {} out, {} replaced, {} cancelled, {} tracked objects flushed",
            id,
            state.stats.packets_in,
            state.stats.packets_out,
            state.stats.replaced,
            state.stats.cancelled,
            flushed
        );
        Some(state.stats.clone())
    }

    /// Routes one frame by connection id. Frames of unknown connections pass
    /// through untouched.
    pub fn on_packet(&self, id: ConnectionId, direction: Direction, raw: &[u8]) -> Action {
        match self.connection(id) {
            Some(connection) => tap::intercept(&self.shared, &connection, direction, raw),
            None => {
                debug!(
                    "{} packet for unregistered connection {}",
                    direction.as_str(),
                    id
                );
                Action::PassThrough
            }
        }
    }

    /// Advances every connection to `now` and sweeps its tracker.
    ///
    /// Entries whose TTL ends at `now` stop being tracked immediately but
    /// can still be resolved by a confirmation arriving before the next tick.
    pub fn tick(&self, now: Tick) -> TickReport {
        let now = self.now.fetch_max(now, Ordering::AcqRel).max(now);
        let connections: Vec<Arc<Connection>> = self.read().values().cloned().collect();

        let mut report = TickReport {
            now,
            ..TickReport::default()
        };
        for connection in connections {
            let mut state = connection.lock();
            if state.closed {
                continue;
            }
            state.advance(now);
            let now = state.now;
            let sweep = state.tracker.sweep(now);
            for object in &sweep.expired {
                debug!(
                    "Connection {}: {} at {} expired unconfirmed",
                    state.id, object.kind, object.position
                );
            }
            state.stats.expired += sweep.expired.len() as u64;

            report.connections += 1;
            report.lapsed += sweep.lapsed;
            report.expired += sweep.expired.len();
        }

        report
    }

    /// Fresh handle to a registered connection.
    pub fn tap(&self, id: ConnectionId) -> Option<ConnectionTap> {
        self.connection(id)
            .map(|connection| ConnectionTap::new(id, connection, Arc::clone(&self.shared)))
    }

    /// Active tracked object at `position` on connection `id`. Lapsed and
    /// resolved objects are not returned.
    pub fn lookup(&self, id: ConnectionId, position: BlockPos) -> Option<TrackedObject> {
        self.connection(id)?.lock().lookup(position)
    }

    /// Snapshot of a live connection's counters.
    pub fn stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        Some(self.connection(id)?.lock().stats.clone())
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    /// Registered connection ids in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KindRule, ObjectKind, StateRange};
    use crate::query::QueryError;
    use crate::tap::PacketInterceptor;
    use protocol::{BlockChange, BlockState, Confirmation, PacketRecord};

    const POS: BlockPos = BlockPos::new(1, 2, 3);
    const VERSION: u32 = 763;

    fn config() -> EngineConfig {
        EngineConfig::with_kinds(vec![KindRule::new(
            ObjectKind::Anvil,
            vec![StateRange::new(100, 111)],
            50,
        )])
    }

    fn engine(query: Option<Arc<dyn StateQuery>>) -> Engine {
        let _ = env_logger::builder().is_test(true).try_init();
        Engine::new(Arc::new(ProtocolRegistry::standard()), config(), query).unwrap()
    }

    fn block_change(state: u32) -> Vec<u8> {
        ProtocolRegistry::standard()
            .encode(
                &PacketRecord::BlockChange(BlockChange::new(POS, BlockState(state))),
                VERSION,
            )
            .unwrap()
    }

    fn pong(id: i32) -> Vec<u8> {
        ProtocolRegistry::standard()
            .encode(&PacketRecord::ConfirmReply(Confirmation::Ping { id }), VERSION)
            .unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let bad = EngineConfig {
            default_ttl_ticks: 0,
            ..config()
        };
        let result = Engine::new(Arc::new(ProtocolRegistry::standard()), bad, None);
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));

        let result = Engine::new(Arc::new(ProtocolRegistry::new()), config(), None);
        assert!(matches!(result, Err(EngineError::EmptyRegistry)));
    }

    #[test]
    fn test_register_and_unregister() {
        let engine = engine(None);
        let tap = engine.register_connection(1, VERSION);
        assert_eq!(tap.id(), 1);
        assert_eq!(tap.protocol_version(), VERSION);
        assert_eq!(engine.connection_count(), 1);

        engine.on_packet(1, Direction::Outbound, &block_change(100));
        assert!(engine.lookup(1, POS).is_some());

        let stats = engine.unregister_connection(1).unwrap();
        assert_eq!(stats.packets_out, 1);
        assert_eq!(stats.armed, 1);
        assert_eq!(engine.connection_count(), 0);
        assert!(engine.lookup(1, POS).is_none());
        assert!(engine.stats(1).is_none());
        assert!(engine.unregister_connection(1).is_none());
        assert!(tap.is_closed());
    }

    #[test]
    fn test_reregistration_replaces_context() {
        let engine = engine(None);
        let old = engine.register_connection(1, VERSION);
        old.intercept(Direction::Outbound, &block_change(100));

        let new = engine.register_connection(1, VERSION);
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(engine.lookup(1, POS).is_none());
        assert_eq!(engine.connection_count(), 1);
    }

    #[test]
    fn test_stale_update_is_replaced() {
        let query: Arc<dyn StateQuery> =
            Arc::new(|_: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
                Ok(BlockState(104))
            });
        let engine = engine(Some(query));
        engine.tick(100);
        engine.register_connection(1, VERSION);

        assert_eq!(
            engine.on_packet(1, Direction::Outbound, &block_change(100)),
            Action::PassThrough
        );
        engine.tick(105);

        match engine.on_packet(1, Direction::Outbound, &block_change(108)) {
            Action::Replace(bytes) => assert_eq!(bytes, block_change(104)),
            other => panic!("Unexpected action: {:?}", other),
        }
        assert_eq!(engine.stats(1).unwrap().replaced, 1);
    }

    #[test]
    fn test_tick_expires_after_ttl() {
        let engine = engine(None);
        engine.tick(100);
        engine.register_connection(1, VERSION);
        engine.on_packet(1, Direction::Outbound, &block_change(100));

        assert_eq!(engine.tick(149).lapsed, 0);
        assert!(engine.lookup(1, POS).is_some());

        let report = engine.tick(150);
        assert_eq!(report.connections, 1);
        assert_eq!(report.lapsed, 1);
        assert!(engine.lookup(1, POS).is_none());

        assert_eq!(engine.tick(151).expired, 1);
        assert_eq!(engine.stats(1).unwrap().expired, 1);
    }

    #[test]
    fn test_confirmation_at_expiry_tick_resolves() {
        let engine = engine(None);
        engine.tick(100);
        let tap = engine.register_connection(1, VERSION);
        tap.intercept(Direction::Outbound, &block_change(100));

        let probe = tap.confirmation_probe().unwrap();
        assert_eq!(
            tap.intercept(Direction::Outbound, &probe),
            Action::PassThrough
        );

        engine.tick(150);
        assert_eq!(tap.intercept(Direction::Inbound, &pong(-1)), Action::Cancel);
        assert_eq!(engine.tick(151).expired, 0);

        let stats = tap.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.expired, 0);
    }

    #[test]
    fn test_time_never_runs_backwards() {
        let engine = engine(None);
        engine.tick(20);
        assert_eq!(engine.tick(10).now, 20);
        assert_eq!(engine.now(), 20);
    }

    #[test]
    fn test_unknown_connection_passes_through() {
        let engine = engine(None);
        assert_eq!(
            engine.on_packet(9, Direction::Outbound, &block_change(100)),
            Action::PassThrough
        );
        assert!(engine.tap(9).is_none());
        assert_eq!(engine.tick(1).connections, 0);
    }

    #[test]
    fn test_unknown_protocol_version_passes_through() {
        let engine = engine(None);
        let tap = engine.register_connection(1, 5);
        assert_eq!(
            tap.intercept(Direction::Outbound, &block_change(100)),
            Action::PassThrough
        );
        assert!(tap.confirmation_probe().is_none());
        assert_eq!(tap.stats().unknown_version, 1);
        assert_eq!(tap.tracked_count(), 0);
    }
}
