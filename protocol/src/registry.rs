//! Protocol-version registry mapping version ranges to packet layouts.
//!
//! A registry is an ordinary value. Build one with [`ProtocolRegistry::standard`]
//! or register layouts by hand, then share it (usually behind an `Arc`) with
//! every engine that needs it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec;
use crate::error::{ProtocolError, RegistryError};
use crate::packet::{PacketEnvelope, PacketRecord};
use crate::position::PositionEncoding;
use crate::Direction;

/// Inclusive range of protocol version numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: u32,
    pub max: u32,
}

impl VersionRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub const fn single(version: u32) -> Self {
        Self::new(version, version)
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, version: u32) -> bool {
        self.min <= version && version <= self.max
    }

    pub fn overlaps(&self, other: &VersionRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// How a version confirms that the client caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationStyle {
    /// Window-0 transactions with negative action numbers.
    Transaction,
    /// Dedicated ping/pong packets.
    PingPong,
}

impl ConfirmationStyle {
    /// Inclusive bounds of the ids this style can carry.
    pub fn id_bounds(self) -> (i32, i32) {
        match self {
            ConfirmationStyle::Transaction => (i32::from(i16::MIN), -1),
            ConfirmationStyle::PingPong => (i32::MIN, i32::MAX),
        }
    }
}

/// Packet ids of the recognized packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketIds {
    /// Outbound single block update.
    pub block_change: i32,
    /// Outbound ping or transaction.
    pub confirm_probe: i32,
    /// Inbound pong or transaction.
    pub confirm_reply: i32,
}

/// Field layout of the recognized packets for one range of versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLayout {
    pub label: String,
    pub ids: PacketIds,
    pub position: PositionEncoding,
    pub confirmation: ConfirmationStyle,
}

impl VersionLayout {
    pub fn new(
        label: impl Into<String>,
        ids: PacketIds,
        position: PositionEncoding,
        confirmation: ConfirmationStyle,
    ) -> Self {
        Self {
            label: label.into(),
            ids,
            position,
            confirmation,
        }
    }

    /// Wraps one frame in a [`PacketEnvelope`], decoding the body when this
    /// layout recognizes the packet id for `direction`.
    pub fn open<'a>(
        &self,
        raw: &'a [u8],
        direction: Direction,
    ) -> Result<PacketEnvelope<'a>, ProtocolError> {
        codec::open_with(self, raw, direction)
    }

    /// Decodes a frame. `Ok(None)` means the packet id is not one of the
    /// recognized packets.
    pub fn decode(
        &self,
        raw: &[u8],
        direction: Direction,
    ) -> Result<Option<PacketRecord>, ProtocolError> {
        codec::decode_with(self, raw, direction)
    }

    /// Encodes a record with this layout's packet ids and field formats.
    /// Positions outside the packed range are rejected rather than
    /// truncated.
    pub fn encode(&self, record: &PacketRecord) -> Result<Vec<u8>, ProtocolError> {
        codec::encode_with(self, record)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    entries: Vec<(VersionRange, VersionLayout)>,
}

impl ProtocolRegistry {
    /// Creates an empty registry; every version is unknown until registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the layouts of the released versions from
    /// 1.8 through 1.20.2.
    pub fn standard() -> Self {
        use ConfirmationStyle::{PingPong, Transaction};
        use PositionEncoding::{Xyz, Xzy};

        // (block change, probe, reply) ids of the play state.
        let table = [
            (VersionRange::single(47), "1.8", (0x23, 0x32, 0x0F), Xyz, Transaction),
            (VersionRange::new(107, 316), "1.9-1.11.2", (0x0B, 0x11, 0x05), Xyz, Transaction),
            (VersionRange::single(335), "1.12", (0x0B, 0x11, 0x06), Xyz, Transaction),
            (VersionRange::new(338, 340), "1.12.1-1.12.2", (0x0B, 0x11, 0x05), Xyz, Transaction),
            (VersionRange::new(393, 404), "1.13", (0x0B, 0x12, 0x06), Xyz, Transaction),
            (VersionRange::new(477, 498), "1.14", (0x0B, 0x13, 0x07), Xzy, Transaction),
            (VersionRange::new(573, 578), "1.15", (0x0C, 0x14, 0x07), Xzy, Transaction),
            (VersionRange::new(735, 754), "1.16", (0x0B, 0x11, 0x07), Xzy, Transaction),
            (VersionRange::new(755, 758), "1.17-1.18.2", (0x0C, 0x30, 0x1D), Xzy, PingPong),
            (VersionRange::single(759), "1.19", (0x09, 0x2D, 0x1F), Xzy, PingPong),
            (VersionRange::single(760), "1.19.1-1.19.2", (0x09, 0x2F, 0x20), Xzy, PingPong),
            (VersionRange::single(761), "1.19.3", (0x09, 0x2E, 0x1F), Xzy, PingPong),
            (VersionRange::new(762, 763), "1.19.4-1.20.1", (0x0A, 0x32, 0x20), Xzy, PingPong),
            (VersionRange::single(764), "1.20.2", (0x09, 0x33, 0x23), Xzy, PingPong),
        ];

        let mut registry = Self::new();
        for (range, label, (block_change, confirm_probe, confirm_reply), position, confirmation) in
            table
        {
            let ids = PacketIds {
                block_change,
                confirm_probe,
                confirm_reply,
            };
            registry
                .entries
                .push((range, VersionLayout::new(label, ids, position, confirmation)));
        }
        registry
    }

    /// Adds a layout for `range`. Ranges may not overlap anything already
    /// registered.
    pub fn register(
        &mut self,
        range: VersionRange,
        layout: VersionLayout,
    ) -> Result<(), RegistryError> {
        if range.is_empty() {
            return Err(RegistryError::EmptyRange(range));
        }
        if layout.ids.block_change == layout.ids.confirm_probe {
            return Err(RegistryError::DuplicatePacketId {
                label: layout.label,
                id: layout.ids.block_change,
            });
        }
        if let Some((existing, _)) = self.entries.iter().find(|(r, _)| r.overlaps(&range)) {
            return Err(RegistryError::Overlap {
                new: range,
                existing: *existing,
            });
        }

        self.entries.push((range, layout));
        self.entries.sort_by_key(|(r, _)| r.min);
        Ok(())
    }

    /// Layout whose range contains `version`.
    pub fn layout(&self, version: u32) -> Result<&VersionLayout, ProtocolError> {
        self.entries
            .iter()
            .find(|(range, _)| range.contains(version))
            .map(|(_, layout)| layout)
            .ok_or(ProtocolError::UnknownProtocolVersion(version))
    }

    pub fn supports(&self, version: u32) -> bool {
        self.layout(version).is_ok()
    }

    /// Registered ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = &VersionRange> {
        self.entries.iter().map(|(range, _)| range)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes `raw` under `version`. `Ok(None)` means the packet is not one
    /// the engine cares about and should be treated as opaque bytes.
    pub fn decode(
        &self,
        raw: &[u8],
        version: u32,
        direction: Direction,
    ) -> Result<Option<PacketRecord>, ProtocolError> {
        self.layout(version)?.decode(raw, direction)
    }

    /// Encodes `record` under `version`.
    pub fn encode(&self, record: &PacketRecord, version: u32) -> Result<Vec<u8>, ProtocolError> {
        self.layout(version)?.encode(record)
    }
}
