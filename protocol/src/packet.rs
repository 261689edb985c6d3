use serde::{Deserialize, Serialize};

use crate::position::BlockPos;
use crate::Direction;

/// Raw block-state id as carried in a VarInt on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockState(pub u32);

impl BlockState {
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Single-block update sent to the client.
///
/// Anything after the state id is kept verbatim in `trailing` and written
/// back out unchanged on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChange {
    pub position: BlockPos,
    pub state: BlockState,
    pub trailing: Vec<u8>,
}

impl BlockChange {
    pub fn new(position: BlockPos, state: BlockState) -> Self {
        Self {
            position,
            state,
            trailing: Vec::new(),
        }
    }

    /// Same packet with a different state id.
    pub fn with_state(&self, state: BlockState) -> Self {
        Self {
            position: self.position,
            state,
            trailing: self.trailing.clone(),
        }
    }
}

/// Ping-style packet whose reply proves the client has processed everything
/// sent before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Confirmation {
    /// Ping/pong pair, protocol 755 and later.
    Ping { id: i32 },
    /// Window confirmation on older protocols.
    Transaction {
        window_id: i8,
        action: i16,
        accepted: bool,
    },
}

impl Confirmation {
    pub fn id(&self) -> i32 {
        match *self {
            Confirmation::Ping { id } => id,
            Confirmation::Transaction { action, .. } => i32::from(action),
        }
    }

    /// Transactions on a real inventory window belong to the game, not to
    /// whoever is probing the client.
    pub fn is_probe_window(&self) -> bool {
        match *self {
            Confirmation::Ping { .. } => true,
            Confirmation::Transaction { window_id, .. } => window_id == 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Confirmation::Ping { .. } => "ping",
            Confirmation::Transaction { .. } => "transaction",
        }
    }
}

/// Decoded form of a packet the engine understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketRecord {
    BlockChange(BlockChange),
    ConfirmProbe(Confirmation),
    ConfirmReply(Confirmation),
}

impl PacketRecord {
    pub fn direction(&self) -> Direction {
        match self {
            PacketRecord::BlockChange(_) | PacketRecord::ConfirmProbe(_) => Direction::Outbound,
            PacketRecord::ConfirmReply(_) => Direction::Inbound,
        }
    }

    pub fn position(&self) -> Option<BlockPos> {
        match self {
            PacketRecord::BlockChange(change) => Some(change.position),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PacketRecord::BlockChange(_) => "block change",
            PacketRecord::ConfirmProbe(_) => "confirmation probe",
            PacketRecord::ConfirmReply(_) => "confirmation reply",
        }
    }
}

/// A packet as observed by a tap: where it is going, what it claims to be,
/// and its decoded form when recognized.
#[derive(Debug, Clone)]
pub struct PacketEnvelope<'a> {
    pub direction: Direction,
    pub packet_id: i32,
    pub raw: &'a [u8],
    pub record: Option<PacketRecord>,
}

impl PacketEnvelope<'_> {
    pub fn is_recognized(&self) -> bool {
        self.record.is_some()
    }

    /// Name of the decoded record, or `"opaque"` for anything else.
    pub fn name(&self) -> &'static str {
        self.record
            .as_ref()
            .map(PacketRecord::name)
            .unwrap_or("opaque")
    }
}
