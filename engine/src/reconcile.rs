//! Decides what happens to each recognized packet.
//!
//! A tracked position is *armed* from the moment the server tells the client
//! about a predictable state until the client confirms it has processed that
//! packet, or the TTL runs out. While armed:
//!
//! - a block change repeating the predicted state is cancelled as redundant;
//! - any other block change is checked against the host's authoritative
//!   state, and either passed, rewritten to the authoritative state, or
//!   cancelled when the host cannot answer.
//!
//! Both a passed and a rewritten update re-arm the position from scratch: the
//! client now renders a new state, so only a probe sent after it can confirm
//! it, and the TTL starts over.
//!
//! Probes inside the connection's reserved id range bind armed positions and
//! join the connection's queue of outstanding probes. Clients answer in send
//! order, so a reply to probe `N` confirms every outstanding probe up to and
//! including `N`. A reply that matches nothing outstanding is left alone.

use log::debug;
use protocol::{BlockChange, BlockPos, BlockState, Confirmation, PacketEnvelope, PacketRecord};
use std::panic::{self, AssertUnwindSafe};

use crate::config::{ObjectKind, PredictionCatalogue};
use crate::connection::ConnectionState;
use crate::error::Anomaly;
use crate::query::{QueryError, StateQuery};
use crate::tracker::TrackedObject;

/// Outcome of reconciling one record, before any re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Rewrite(PacketRecord),
    Cancel,
}

pub struct Reconciler<'a> {
    catalogue: &'a PredictionCatalogue,
    query: Option<&'a dyn StateQuery>,
    consume_confirmations: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        catalogue: &'a PredictionCatalogue,
        query: Option<&'a dyn StateQuery>,
        consume_confirmations: bool,
    ) -> Self {
        Self {
            catalogue,
            query,
            consume_confirmations,
        }
    }

    /// Opaque envelopes always pass.
    pub fn reconcile(&self, state: &mut ConnectionState, envelope: &PacketEnvelope<'_>) -> Verdict {
        match &envelope.record {
            Some(PacketRecord::BlockChange(change)) => self.block_change(state, change),
            Some(PacketRecord::ConfirmProbe(probe)) => self.probe(state, probe),
            Some(PacketRecord::ConfirmReply(reply)) => self.reply(state, reply),
            None => Verdict::Pass,
        }
    }

    fn block_change(&self, state: &mut ConnectionState, change: &BlockChange) -> Verdict {
        let position = change.position;
        let armed = state.tracker.lookup(position).cloned();

        let tracked = match armed {
            Some(tracked) => tracked,
            None => {
                if let Some(kind) = self.catalogue.kind_of(change.state) {
                    self.arm(state, position, change.state, kind);
                }
                return Verdict::Pass;
            }
        };

        if change.state == tracked.predicted {
            debug!(
                "Connection {}: cancelling redundant {} update at {}",
                state.id, tracked.kind, position
            );
            return Verdict::Cancel;
        }

        let authoritative = match self.authoritative(&tracked) {
            Ok(authoritative) => authoritative,
            Err(reason) => {
                state.record(Anomaly::HostCallbackFailure {
                    position,
                    kind: tracked.kind,
                    reason,
                });
                return Verdict::Cancel;
            }
        };

        if authoritative == change.state {
            // The packet is now the client's latest view of this position.
            match self.catalogue.kind_of(change.state) {
                Some(kind) => self.arm(state, position, change.state, kind),
                None => self.release(state, &tracked),
            }
            Verdict::Pass
        } else {
            debug!(
                "Connection {}: rewriting {} at {} from {:?} to {:?}",
                state.id, tracked.kind, position, change.state, authoritative
            );
            match self.catalogue.kind_of(authoritative) {
                Some(kind) => {
                    // Rearmed by the engine itself, so not an overwrite.
                    let now = state.now;
                    state.tracker.insert(position, kind, authoritative, now);
                }
                None => self.release(state, &tracked),
            }
            Verdict::Rewrite(PacketRecord::BlockChange(change.with_state(authoritative)))
        }
    }

    /// Asks the host for the server-side state. A panicking query counts as a
    /// failed one.
    fn authoritative(&self, tracked: &TrackedObject) -> Result<BlockState, String> {
        let query = self
            .query
            .ok_or_else(|| QueryError::Unavailable.to_string())?;

        let answer = panic::catch_unwind(AssertUnwindSafe(|| {
            query.query_state(tracked.position, tracked.kind)
        }));
        match answer {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("state query panicked".to_string()),
        }
    }

    fn arm(
        &self,
        state: &mut ConnectionState,
        position: BlockPos,
        predicted: BlockState,
        kind: ObjectKind,
    ) {
        let now = state.now;
        let insertion = state.tracker.insert(position, kind, predicted, now);
        state.stats.armed += 1;

        if let Some(previous) = insertion.replaced {
            state.record(Anomaly::TrackerOverwrite {
                position,
                kind,
                previous: previous.predicted,
                current: predicted,
            });
        }
        if let Some(evicted) = insertion.evicted {
            state.record(Anomaly::CapacityEviction {
                position: evicted.position,
                kind: evicted.kind,
            });
        }
        debug!(
            "Connection {}: armed {} at {} until tick {}",
            state.id,
            kind,
            position,
            now.saturating_add(self.catalogue.ttl(kind))
        );
    }

    fn release(&self, state: &mut ConnectionState, tracked: &TrackedObject) {
        state.tracker.release(tracked.position);
        state.stats.released += 1;
        debug!(
            "Connection {}: {} at {} is no longer predictable",
            state.id, tracked.kind, tracked.position
        );
    }

    fn probe(&self, state: &mut ConnectionState, probe: &Confirmation) -> Verdict {
        if probe.is_probe_window() && state.owns_confirmation(probe.id()) {
            state.probe_sent(probe.id());
            let bound = state.tracker.bind_confirmation(probe.id());
            if bound > 0 {
                debug!(
                    "Connection {}: {} {} covers {} tracked objects",
                    state.id,
                    probe.name(),
                    probe.id(),
                    bound
                );
            }
        }
        Verdict::Pass
    }

    fn reply(&self, state: &mut ConnectionState, reply: &Confirmation) -> Verdict {
        if !reply.is_probe_window() || !state.owns_confirmation(reply.id()) {
            return Verdict::Pass;
        }

        let confirmed = match state.take_confirmed(reply.id()) {
            Some(confirmed) => confirmed,
            None => {
                // Someone else's, or a duplicate; the host gets to see it.
                state.record(Anomaly::UnexpectedConfirmation(reply.id()));
                return Verdict::Pass;
            }
        };
        if let Some(&expected) = confirmed.first() {
            if expected != reply.id() {
                state.record(Anomaly::OutOfOrderConfirmation {
                    expected,
                    received: reply.id(),
                });
            }
        }

        let now = state.now;
        let mut resolved = 0;
        for id in confirmed {
            resolved += state.tracker.resolve_confirmation(id, now).len();
        }
        if resolved > 0 {
            state.stats.resolved += resolved as u64;
            debug!(
                "Connection {}: {} {} resolved {} tracked objects",
                state.id,
                reply.name(),
                reply.id(),
                resolved
            );
        }

        if self.consume_confirmations {
            Verdict::Cancel
        } else {
            Verdict::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, KindRule, StateRange};
    use protocol::{Direction, ProtocolRegistry};
    use std::sync::Arc;

    const POS: BlockPos = BlockPos::new(1, 2, 3);
    const ANVIL: BlockState = BlockState(100);
    const ANVIL_DAMAGED: BlockState = BlockState(104);
    const STONE: BlockState = BlockState(1);

    fn config() -> EngineConfig {
        EngineConfig::with_kinds(vec![
            KindRule::new(ObjectKind::Anvil, vec![StateRange::new(100, 111)], 50),
            KindRule::new(ObjectKind::Trapdoor, vec![StateRange::new(10, 19)], 20),
        ])
    }

    fn state(config: &EngineConfig) -> ConnectionState {
        let registry = ProtocolRegistry::standard();
        let layout = registry.layout(763).ok().cloned().map(Arc::new);
        ConnectionState::new(1, 763, layout, Arc::new(config.catalogue()), config, 100)
    }

    fn envelope(direction: Direction, record: PacketRecord) -> PacketEnvelope<'static> {
        PacketEnvelope {
            direction,
            packet_id: 0,
            raw: &[],
            record: Some(record),
        }
    }

    fn change(state: BlockState) -> PacketEnvelope<'static> {
        envelope(
            Direction::Outbound,
            PacketRecord::BlockChange(BlockChange::new(POS, state)),
        )
    }

    fn probe(id: i32) -> PacketEnvelope<'static> {
        envelope(
            Direction::Outbound,
            PacketRecord::ConfirmProbe(Confirmation::Ping { id }),
        )
    }

    fn reply(id: i32) -> PacketEnvelope<'static> {
        envelope(
            Direction::Inbound,
            PacketRecord::ConfirmReply(Confirmation::Ping { id }),
        )
    }

    fn damaged_anvil(_: BlockPos, _: ObjectKind) -> Result<BlockState, QueryError> {
        Ok(ANVIL_DAMAGED)
    }

    #[test]
    fn test_arms_predictable_states_only() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);

        assert_eq!(reconciler.reconcile(&mut state, &change(STONE)), Verdict::Pass);
        assert!(state.tracker.is_empty());

        assert_eq!(reconciler.reconcile(&mut state, &change(ANVIL)), Verdict::Pass);
        let tracked = state.tracker.lookup(POS).unwrap();
        assert_eq!(tracked.kind, ObjectKind::Anvil);
        assert_eq!(tracked.predicted, ANVIL);
        assert_eq!(state.stats.armed, 1);
    }

    #[test]
    fn test_redundant_update_is_cancelled() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        assert_eq!(reconciler.reconcile(&mut state, &change(ANVIL)), Verdict::Cancel);
        assert!(state.tracker.lookup(POS).is_some());
    }

    #[test]
    fn test_stale_update_is_rewritten_to_authoritative_state() {
        let config = config();
        let catalogue = config.catalogue();
        let query = |_: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
            Ok(ANVIL_DAMAGED)
        };
        let reconciler = Reconciler::new(&catalogue, Some(&query), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        state.advance(105);

        match reconciler.reconcile(&mut state, &change(BlockState(108))) {
            Verdict::Rewrite(PacketRecord::BlockChange(rewritten)) => {
                assert_eq!(rewritten.position, POS);
                assert_eq!(rewritten.state, ANVIL_DAMAGED);
            }
            other => panic!("Unexpected verdict: {:?}", other),
        }
        let tracked = state.tracker.lookup(POS).unwrap();
        assert_eq!(tracked.predicted, ANVIL_DAMAGED);
        assert_eq!(tracked.created_at, 105);
        assert_eq!(state.stats.overwritten, 0);
    }

    #[test]
    fn test_rewrite_needs_a_newer_confirmation() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, Some(&damaged_anvil), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        reconciler.reconcile(&mut state, &probe(-1));
        assert!(matches!(
            reconciler.reconcile(&mut state, &change(BlockState(108))),
            Verdict::Rewrite(_)
        ));
        assert_eq!(state.tracker.lookup(POS).unwrap().confirmation, None);

        // The reply only covers what the client saw before the rewrite.
        assert_eq!(reconciler.reconcile(&mut state, &reply(-1)), Verdict::Cancel);
        assert!(state.tracker.lookup(POS).is_some());
        assert!(matches!(
            reconciler.reconcile(&mut state, &change(BlockState(108))),
            Verdict::Rewrite(_)
        ));

        reconciler.reconcile(&mut state, &probe(-2));
        reconciler.reconcile(&mut state, &reply(-2));
        assert!(state.tracker.lookup(POS).is_none());
        assert_eq!(state.stats.resolved, 1);
    }

    #[test]
    fn test_rewrite_restarts_ttl() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, Some(&damaged_anvil), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        state.advance(149);
        reconciler.reconcile(&mut state, &change(BlockState(108)));

        state.advance(150);
        state.tracker.sweep(150);
        let tracked = state.tracker.lookup(POS).unwrap();
        assert_eq!(tracked.expires_at, 199);
    }

    #[test]
    fn test_rewrite_to_unpredictable_state_releases() {
        let config = config();
        let catalogue = config.catalogue();
        let query = |_: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
            Ok(STONE)
        };
        let reconciler = Reconciler::new(&catalogue, Some(&query), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        assert_eq!(
            reconciler.reconcile(&mut state, &change(ANVIL_DAMAGED)),
            Verdict::Rewrite(PacketRecord::BlockChange(BlockChange::new(POS, STONE)))
        );
        assert!(state.tracker.lookup(POS).is_none());
        assert_eq!(state.stats.released, 1);
    }

    #[test]
    fn test_correct_update_passes_and_rearms() {
        let config = config();
        let catalogue = config.catalogue();
        let query = |_: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
            Ok(ANVIL_DAMAGED)
        };
        let reconciler = Reconciler::new(&catalogue, Some(&query), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        state.advance(110);
        assert_eq!(
            reconciler.reconcile(&mut state, &change(ANVIL_DAMAGED)),
            Verdict::Pass
        );

        let tracked = state.tracker.lookup(POS).unwrap();
        assert_eq!(tracked.predicted, ANVIL_DAMAGED);
        assert_eq!(tracked.created_at, 110);
        assert_eq!(state.stats.overwritten, 1);
    }

    #[test]
    fn test_correct_unpredictable_update_releases() {
        let config = config();
        let catalogue = config.catalogue();
        let query = |_: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
            Ok(STONE)
        };
        let reconciler = Reconciler::new(&catalogue, Some(&query), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        assert_eq!(reconciler.reconcile(&mut state, &change(STONE)), Verdict::Pass);
        assert!(state.tracker.lookup(POS).is_none());
        assert_eq!(state.stats.released, 1);
    }

    #[test]
    fn test_failing_query_cancels() {
        let config = config();
        let catalogue = config.catalogue();
        let failing = |position: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
            Err(QueryError::Unloaded(position))
        };
        let reconciler = Reconciler::new(&catalogue, Some(&failing), true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        assert_eq!(
            reconciler.reconcile(&mut state, &change(ANVIL_DAMAGED)),
            Verdict::Cancel
        );
        assert_eq!(state.stats.callback_failures, 1);
        assert_eq!(state.tracker.lookup(POS).unwrap().predicted, ANVIL);
    }

    #[test]
    fn test_missing_or_panicking_query_cancels() {
        let config = config();
        let catalogue = config.catalogue();
        let mut state = state(&config);

        let without = Reconciler::new(&catalogue, None, true);
        without.reconcile(&mut state, &change(ANVIL));
        assert_eq!(
            without.reconcile(&mut state, &change(ANVIL_DAMAGED)),
            Verdict::Cancel
        );

        let panicking = |_: BlockPos, _: ObjectKind| -> Result<BlockState, QueryError> {
            panic!("host exploded")
        };
        let reconciler = Reconciler::new(&catalogue, Some(&panicking), true);
        assert_eq!(
            reconciler.reconcile(&mut state, &change(ANVIL_DAMAGED)),
            Verdict::Cancel
        );
        assert_eq!(state.stats.callback_failures, 2);
        match state.recent_anomalies().last() {
            Some(Anomaly::HostCallbackFailure { reason, .. }) => {
                assert_eq!(reason, "state query panicked")
            }
            other => panic!("Unexpected anomaly: {:?}", other),
        }
    }

    #[test]
    fn test_probe_and_reply_resolve() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        assert_eq!(
            reconciler.reconcile(&mut state, &probe(-1)),
            Verdict::Pass
        );
        assert_eq!(state.tracker.lookup(POS).unwrap().confirmation, Some(-1));

        assert_eq!(
            reconciler.reconcile(&mut state, &reply(-1)),
            Verdict::Cancel
        );
        assert!(state.tracker.lookup(POS).is_none());
        assert_eq!(state.stats.resolved, 1);
    }

    #[test]
    fn test_foreign_confirmations_are_untouched() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        reconciler.reconcile(&mut state, &probe(42));
        assert_eq!(state.tracker.lookup(POS).unwrap().confirmation, None);

        assert_eq!(
            reconciler.reconcile(&mut state, &reply(42)),
            Verdict::Pass
        );
        assert!(state.tracker.lookup(POS).is_some());
    }

    #[test]
    fn test_reply_confirms_earlier_probes() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);
        let second = BlockPos::new(9, 9, 9);

        reconciler.reconcile(&mut state, &change(ANVIL));
        reconciler.reconcile(&mut state, &probe(-1));
        reconciler.reconcile(
            &mut state,
            &envelope(
                Direction::Outbound,
                PacketRecord::BlockChange(BlockChange::new(second, ANVIL)),
            ),
        );
        reconciler.reconcile(&mut state, &probe(-2));

        // The reply to -1 went missing; -2 still proves the client saw both.
        assert_eq!(reconciler.reconcile(&mut state, &reply(-2)), Verdict::Cancel);
        assert!(state.tracker.is_empty());
        assert_eq!(state.stats.resolved, 2);
        assert_eq!(state.stats.out_of_order_confirmations, 1);
        assert_eq!(
            state.recent_anomalies().last(),
            Some(&Anomaly::OutOfOrderConfirmation {
                expected: -1,
                received: -2
            })
        );
        assert_eq!(state.outstanding_probes(), 0);
    }

    #[test]
    fn test_unsent_reply_in_range_passes() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        reconciler.reconcile(&mut state, &probe(-1));

        // Another plugin's ping inside the range, and a duplicate reply.
        assert_eq!(reconciler.reconcile(&mut state, &reply(-7)), Verdict::Pass);
        assert!(state.tracker.lookup(POS).is_some());
        assert_eq!(reconciler.reconcile(&mut state, &reply(-1)), Verdict::Cancel);
        assert_eq!(reconciler.reconcile(&mut state, &reply(-1)), Verdict::Pass);

        assert_eq!(state.stats.unexpected_confirmations, 2);
        assert_eq!(state.stats.resolved, 1);
    }

    #[test]
    fn test_opaque_envelope_passes() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, true);
        let mut state = state(&config);

        let opaque = PacketEnvelope {
            direction: Direction::Outbound,
            packet_id: 0x7F,
            raw: &[0x7F, 0x00],
            record: None,
        };
        assert_eq!(reconciler.reconcile(&mut state, &opaque), Verdict::Pass);
        assert!(state.tracker.is_empty());
    }

    #[test]
    fn test_replies_pass_when_not_consuming() {
        let config = config();
        let catalogue = config.catalogue();
        let reconciler = Reconciler::new(&catalogue, None, false);
        let mut state = state(&config);

        reconciler.reconcile(&mut state, &change(ANVIL));
        reconciler.reconcile(&mut state, &probe(-3));
        assert_eq!(
            reconciler.reconcile(&mut state, &reply(-3)),
            Verdict::Pass
        );
        assert!(state.tracker.is_empty());
    }
}
