use protocol::{BlockPos, BlockState, ProtocolError};
use thiserror::Error;

use crate::config::{ConfigError, ObjectKind};

/// Failures when constructing an engine. Nothing on the packet path returns
/// this; per-packet problems are [`Anomaly`] values instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("protocol registry has no layouts")]
    EmptyRegistry,
}

/// Something unusual observed while handling a connection's packets. All of
/// these are recovered locally; they are logged and counted, never returned
/// to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("undecodable packet: {0}")]
    Decode(ProtocolError),
    #[error("could not re-encode rewritten packet: {0}")]
    Encode(ProtocolError),
    #[error("no codec layout for protocol version {0}")]
    UnknownProtocolVersion(u32),
    #[error("tracked {kind} at {position} replaced before confirmation ({previous:?} -> {current:?})")]
    TrackerOverwrite {
        position: BlockPos,
        kind: ObjectKind,
        previous: BlockState,
        current: BlockState,
    },
    #[error("authoritative state of {kind} at {position} unavailable: {reason}")]
    HostCallbackFailure {
        position: BlockPos,
        kind: ObjectKind,
        reason: String,
    },
    #[error("tracker full, evicted {kind} at {position}")]
    CapacityEviction { position: BlockPos, kind: ObjectKind },
    #[error("reply to confirmation {0}, which is not outstanding")]
    UnexpectedConfirmation(i32),
    #[error("reply to confirmation {received} skipped earlier confirmation {expected}")]
    OutOfOrderConfirmation { expected: i32, received: i32 },
    #[error("internal fault while handling packet: {0}")]
    InternalFault(String),
}

impl Anomaly {
    pub fn name(&self) -> &'static str {
        match self {
            Anomaly::Decode(_) => "decode",
            Anomaly::Encode(_) => "encode",
            Anomaly::UnknownProtocolVersion(_) => "unknown_protocol_version",
            Anomaly::TrackerOverwrite { .. } => "tracker_overwrite",
            Anomaly::HostCallbackFailure { .. } => "host_callback_failure",
            Anomaly::CapacityEviction { .. } => "capacity_eviction",
            Anomaly::UnexpectedConfirmation(_) => "unexpected_confirmation",
            Anomaly::OutOfOrderConfirmation { .. } => "out_of_order_confirmation",
            Anomaly::InternalFault(_) => "internal_fault",
        }
    }
}
