//! Per-connection entry point for platform adapters.
//!
//! The adapter calls [`PacketInterceptor::intercept`] for every frame it sees
//! on a connection, in the order the frames travel, and applies the returned
//! [`Action`]. Nothing that goes wrong inside the engine escapes this
//! boundary: the worst case is that the frame passes through untouched and an
//! anomaly is counted.

use log::debug;
use protocol::{BlockPos, Direction};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId, ConnectionState, ConnectionStats};
use crate::engine::EngineShared;
use crate::error::Anomaly;
use crate::reconcile::{Reconciler, Verdict};
use crate::tracker::TrackedObject;

/// What the adapter should do with the frame it just handed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Forward the original bytes.
    PassThrough,
    /// Forward these bytes instead.
    Replace(Vec<u8>),
    /// Drop the frame.
    Cancel,
}

impl Action {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Action::PassThrough)
    }

    /// Bytes to forward, if anything is forwarded at all.
    pub fn apply<'a>(&'a self, original: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            Action::PassThrough => Some(original),
            Action::Replace(bytes) => Some(bytes),
            Action::Cancel => None,
        }
    }
}

/// Hook a host pipeline calls for each frame of one connection.
pub trait PacketInterceptor: Send + Sync {
    fn intercept(&self, direction: Direction, raw: &[u8]) -> Action;
}

/// Handle to one registered connection.
///
/// Cheap to clone. A tap outlives its registration harmlessly: once the
/// connection is unregistered every frame passes through unprocessed.
#[derive(Clone)]
pub struct ConnectionTap {
    id: ConnectionId,
    connection: Arc<Connection>,
    shared: Arc<EngineShared>,
}

impl ConnectionTap {
    pub(crate) fn new(
        id: ConnectionId,
        connection: Arc<Connection>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            id,
            connection,
            shared,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn protocol_version(&self) -> u32 {
        self.connection.lock().protocol_version
    }

    pub fn is_closed(&self) -> bool {
        self.connection.lock().closed
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connection.lock().stats.clone()
    }

    pub fn lookup(&self, position: BlockPos) -> Option<TrackedObject> {
        self.connection.lock().lookup(position)
    }

    pub fn tracked_count(&self) -> usize {
        let state = self.connection.lock();
        if state.closed {
            0
        } else {
            state.tracker.len()
        }
    }

    /// Recently recorded anomalies, oldest first.
    pub fn recent_anomalies(&self) -> Vec<Anomaly> {
        self.connection.lock().recent_anomalies().cloned().collect()
    }

    /// Encodes the next confirmation probe for this connection.
    ///
    /// The adapter sends it to the client like any other outbound frame,
    /// through [`intercept`](PacketInterceptor::intercept), usually once per
    /// tick after the tick's block changes. Every tracked object still waiting
    /// for a probe is then resolved by the client's reply. Returns `None` for a
    /// closed connection or one without a codec layout.
    pub fn confirmation_probe(&self) -> Option<Vec<u8>> {
        let mut state = self.connection.lock();
        if state.closed {
            return None;
        }
        let layout = state.layout.clone()?;
        let probe = state.next_probe()?;
        match layout.encode(&probe) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                state.record(Anomaly::Encode(err));
                None
            }
        }
    }
}

impl PacketInterceptor for ConnectionTap {
    fn intercept(&self, direction: Direction, raw: &[u8]) -> Action {
        intercept(&self.shared, &self.connection, direction, raw)
    }
}

impl std::fmt::Debug for ConnectionTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTap").field("id", &self.id).finish()
    }
}

pub(crate) fn intercept(
    shared: &EngineShared,
    connection: &Connection,
    direction: Direction,
    raw: &[u8],
) -> Action {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut state = connection.lock();
        process(shared, &mut state, direction, raw)
    }));

    match outcome {
        Ok(action) => action,
        Err(payload) => {
            let mut state = connection.lock();
            state.record(Anomaly::InternalFault(panic_message(payload.as_ref())));
            state.stats.passed += 1;
            Action::PassThrough
        }
    }
}

fn process(
    shared: &EngineShared,
    state: &mut ConnectionState,
    direction: Direction,
    raw: &[u8],
) -> Action {
    if state.closed {
        return Action::PassThrough;
    }

    match direction {
        Direction::Inbound => state.stats.packets_in += 1,
        Direction::Outbound => state.stats.packets_out += 1,
    }

    let layout = match state.layout.clone() {
        Some(layout) => layout,
        None => {
            state.record(Anomaly::UnknownProtocolVersion(state.protocol_version));
            state.stats.passed += 1;
            return Action::PassThrough;
        }
    };

    let envelope = match layout.open(raw, direction) {
        Ok(envelope) => envelope,
        Err(err) => {
            state.record(Anomaly::Decode(err));
            state.stats.passed += 1;
            return Action::PassThrough;
        }
    };
    if !envelope.is_recognized() {
        state.stats.passed += 1;
        return Action::PassThrough;
    }
    state.stats.recognized += 1;

    let reconciler = Reconciler::new(
        &shared.catalogue,
        shared.query.as_deref(),
        shared.config.consume_confirmations,
    );
    let action = match reconciler.reconcile(state, &envelope) {
        Verdict::Pass => Action::PassThrough,
        Verdict::Cancel => Action::Cancel,
        Verdict::Rewrite(rewritten) => match layout.encode(&rewritten) {
            Ok(bytes) => Action::Replace(bytes),
            // The stale value must not reach the client either way.
            Err(err) => {
                state.record(Anomaly::Encode(err));
                Action::Cancel
            }
        },
    };

    match &action {
        Action::PassThrough => state.stats.passed += 1,
        Action::Replace(_) => state.stats.replaced += 1,
        Action::Cancel => state.stats.cancelled += 1,
    }
    debug!(
        "Connection {}: {} {} ({:#04x}, {} bytes) -> {:?}",
        state.id,
        envelope.direction.as_str(),
        envelope.name(),
        envelope.packet_id,
        envelope.raw.len(),
        ActionKind(&action)
    );

    action
}

/// Logs an action without its payload.
struct ActionKind<'a>(&'a Action);

impl std::fmt::Debug for ActionKind<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Action::PassThrough => f.write_str("PassThrough"),
            Action::Replace(bytes) => write!(f, "Replace({} bytes)", bytes.len()),
            Action::Cancel => f.write_str("Cancel"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
