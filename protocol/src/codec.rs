use crate::error::{DecodeError, ProtocolError};
use crate::packet::{BlockChange, BlockState, Confirmation, PacketEnvelope, PacketRecord};
use crate::position::BlockPos;
use crate::registry::{ConfirmationStyle, VersionLayout};
use crate::wire::{Reader, Writer, MAX_VARINT_LEN};
use crate::Direction;

/// Reads the frame's packet id and, when `layout` recognizes it for
/// `direction`, decodes the body.
pub fn open_with<'a>(
    layout: &VersionLayout,
    raw: &'a [u8],
    direction: Direction,
) -> Result<PacketEnvelope<'a>, ProtocolError> {
    let mut reader = Reader::new(raw);
    let packet_id = reader
        .read_var_int("packet id")
        .map_err(ProtocolError::decode("frame"))?;
    let ids = &layout.ids;

    let record = match direction {
        Direction::Outbound if packet_id == ids.block_change => {
            let change = read_block_change(&mut reader, layout)
                .map_err(ProtocolError::decode("block change"))?;
            Some(PacketRecord::BlockChange(change))
        }
        Direction::Outbound if packet_id == ids.confirm_probe => {
            let confirmation = read_confirmation(&mut reader, layout.confirmation)
                .map_err(ProtocolError::decode("confirmation probe"))?;
            Some(PacketRecord::ConfirmProbe(confirmation))
        }
        Direction::Inbound if packet_id == ids.confirm_reply => {
            let confirmation = read_confirmation(&mut reader, layout.confirmation)
                .map_err(ProtocolError::decode("confirmation reply"))?;
            Some(PacketRecord::ConfirmReply(confirmation))
        }
        _ => None,
    };

    Ok(PacketEnvelope {
        direction,
        packet_id,
        raw,
        record,
    })
}

pub fn decode_with(
    layout: &VersionLayout,
    raw: &[u8],
    direction: Direction,
) -> Result<Option<PacketRecord>, ProtocolError> {
    open_with(layout, raw, direction).map(|envelope| envelope.record)
}

fn read_block_change(
    reader: &mut Reader<'_>,
    layout: &VersionLayout,
) -> Result<BlockChange, DecodeError> {
    let position = BlockPos::unpack(reader.read_i64("position")?, layout.position);
    let state = BlockState(reader.read_var_int("block state")? as u32);
    let trailing = reader.read_rest().to_vec();
    Ok(BlockChange {
        position,
        state,
        trailing,
    })
}

fn read_confirmation(
    reader: &mut Reader<'_>,
    style: ConfirmationStyle,
) -> Result<Confirmation, DecodeError> {
    let confirmation = match style {
        ConfirmationStyle::PingPong => {
            let id = reader.read_i32("ping id")?;
            Confirmation::Ping { id }
        }
        ConfirmationStyle::Transaction => {
            let window_id = reader.read_i8("window id")?;
            let action = reader.read_i16("action number")?;
            let accepted = reader.read_bool("accepted")?;
            Confirmation::Transaction {
                window_id,
                action,
                accepted,
            }
        }
    };
    reader.finish(confirmation.name())?;
    Ok(confirmation)
}

pub fn encode_with(layout: &VersionLayout, record: &PacketRecord) -> Result<Vec<u8>, ProtocolError> {
    match record {
        PacketRecord::BlockChange(change) => {
            if !change.position.is_packable() {
                return Err(ProtocolError::PositionOutOfRange(change.position));
            }
            let mut writer = Writer::with_capacity(MAX_VARINT_LEN * 2 + 8 + change.trailing.len());
            writer.write_var_int(layout.ids.block_change);
            writer.write_i64(change.position.pack(layout.position));
            writer.write_var_int(change.state.id() as i32);
            writer.write_bytes(&change.trailing);
            Ok(writer.into_inner())
        }
        PacketRecord::ConfirmProbe(confirmation) => {
            encode_confirmation(layout, layout.ids.confirm_probe, confirmation)
        }
        PacketRecord::ConfirmReply(confirmation) => {
            encode_confirmation(layout, layout.ids.confirm_reply, confirmation)
        }
    }
}

fn encode_confirmation(
    layout: &VersionLayout,
    packet_id: i32,
    confirmation: &Confirmation,
) -> Result<Vec<u8>, ProtocolError> {
    let mut writer = Writer::with_capacity(MAX_VARINT_LEN + 4);
    writer.write_var_int(packet_id);

    match (layout.confirmation, *confirmation) {
        (ConfirmationStyle::PingPong, Confirmation::Ping { id }) => writer.write_i32(id),
        (
            ConfirmationStyle::Transaction,
            Confirmation::Transaction {
                window_id,
                action,
                accepted,
            },
        ) => {
            writer.write_i8(window_id);
            writer.write_i16(action);
            writer.write_bool(accepted);
        }
        (style, other) => {
            return Err(ProtocolError::StyleMismatch {
                record: other.name(),
                style,
            })
        }
    }

    Ok(writer.into_inner())
}
