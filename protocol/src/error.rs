use thiserror::Error;

use crate::position::BlockPos;
use crate::registry::{ConfirmationStyle, VersionRange};

/// Failure to read a field out of a packet body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of packet reading {field}: needed {needed} bytes, {available} available")]
    UnexpectedEof {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("VarInt for {field} is longer than 5 bytes")]
    VarIntTooLong { field: &'static str },
    #[error("VarInt for {field} is not minimally encoded")]
    NonCanonicalVarInt { field: &'static str },
    #[error("invalid boolean byte {value:#04x} in {field}")]
    InvalidBool { field: &'static str, value: u8 },
    #[error("{count} unexpected trailing bytes after {packet}")]
    TrailingBytes { packet: &'static str, count: usize },
}

/// Errors surfaced by the versioned codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no codec layout registered for protocol version {0}")]
    UnknownProtocolVersion(u32),
    #[error("malformed {packet} packet: {source}")]
    Decode {
        packet: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error("{record} confirmation cannot be encoded for a {style:?} layout")]
    StyleMismatch {
        record: &'static str,
        style: ConfirmationStyle,
    },
    #[error("block position {0} does not fit the packed position format")]
    PositionOutOfRange(BlockPos),
}

impl ProtocolError {
    pub(crate) fn decode(packet: &'static str) -> impl FnOnce(DecodeError) -> ProtocolError {
        move |source| ProtocolError::Decode { packet, source }
    }
}

/// Rejected codec registrations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("version range {0} is empty")]
    EmptyRange(VersionRange),
    #[error("version range {new} overlaps registered range {existing}")]
    Overlap {
        new: VersionRange,
        existing: VersionRange,
    },
    #[error("layout {label} uses outbound packet id {id:#04x} for two packet types")]
    DuplicatePacketId { label: String, id: i32 },
}
