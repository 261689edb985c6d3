//! # Protocol Model
//!
//! Version-aware decoding and encoding of the handful of game packets the
//! desync engine inspects. Everything else is left as opaque bytes.
//!
//! The adapter hands over one packet frame at a time: the length prefix is
//! already stripped, compression and encryption already undone, so a frame is
//! a VarInt packet id followed by the packet body.
//!
//! ## Recognized packets
//!
//! - **Block change** (outbound): a packed block position and a block-state id.
//! - **Confirmation probe** (outbound): a ping on protocol 755 and later, a
//!   window-0 transaction before that.
//! - **Confirmation reply** (inbound): the matching pong or transaction.
//!
//! Layouts differ between versions in packet ids, in how positions are packed
//! into an `i64`, and in the confirmation packet used. [`ProtocolRegistry`]
//! maps version ranges to a [`VersionLayout`] describing those differences.
//!
//! ## Round trips
//!
//! Decoding followed by encoding an unmodified record reproduces the input
//! byte for byte. Overlong VarInts are rejected during decoding for that
//! reason; no well-behaved server emits them.
//!
//! ```rust
//! use protocol::{BlockPos, Direction, ProtocolRegistry};
//!
//! let registry = ProtocolRegistry::standard();
//! let layout = registry.layout(763).unwrap();
//!
//! let mut raw = vec![layout.ids.block_change as u8];
//! raw.extend_from_slice(&BlockPos::new(1, 2, 3).pack(layout.position).to_be_bytes());
//! raw.push(42);
//!
//! let record = registry.decode(&raw, 763, Direction::Outbound).unwrap().unwrap();
//! assert_eq!(record.position(), Some(BlockPos::new(1, 2, 3)));
//! assert_eq!(registry.encode(&record, 763).unwrap(), raw);
//! ```

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod error;
pub mod packet;
pub mod position;
pub mod registry;
pub mod wire;

pub use error::{DecodeError, ProtocolError, RegistryError};
pub use packet::{BlockChange, BlockState, Confirmation, PacketEnvelope, PacketRecord};
pub use position::{BlockPos, PositionEncoding};
pub use registry::{ConfirmationStyle, PacketIds, ProtocolRegistry, VersionLayout, VersionRange};

/// Which way a packet is travelling, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client to server.
    Inbound,
    /// Server to client.
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}
