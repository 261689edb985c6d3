//! Big-endian primitives and VarInts as they appear on the game's wire.

use crate::error::DecodeError;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Longest legal VarInt encoding of an `i32`.
pub const MAX_VARINT_LEN: usize = 5;

/// Cursor over a borrowed packet body.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the first byte of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof {
                field,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    /// Each `read_*` names the `field` it reads so that a short buffer
    /// reports which field ran out.
    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn read_i8(&mut self, field: &'static str) -> Result<i8, DecodeError> {
        Ok(self.read_u8(field)? as i8)
    }

    /// Only `0x00` and `0x01` are booleans.
    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.read_u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidBool { field, value }),
        }
    }

    /// Big-endian, like every fixed-width integer on the wire.
    pub fn read_i16(&mut self, field: &'static str) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.take_array(field)?))
    }

    pub fn read_i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take_array(field)?))
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take_array(field)?))
    }

    /// Reads a VarInt, rejecting overlong encodings so that re-encoding the
    /// value always reproduces the bytes that were read.
    pub fn read_var_int(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        let mut value: u32 = 0;

        for index in 0..MAX_VARINT_LEN {
            let byte = self.read_u8(field)?;
            value |= u32::from(byte & SEGMENT_BITS) << (7 * index);

            if byte & CONTINUE_BIT == 0 {
                if index > 0 && byte == 0 {
                    return Err(DecodeError::NonCanonicalVarInt { field });
                }
                // Only four payload bits fit in the fifth byte.
                if index == MAX_VARINT_LEN - 1 && byte > 0x0F {
                    return Err(DecodeError::VarIntTooLong { field });
                }
                return Ok(value as i32);
            }
        }

        Err(DecodeError::VarIntTooLong { field })
    }

    /// Consumes and returns everything left in the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self, packet: &'static str) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(DecodeError::TrailingBytes { packet, count }),
        }
    }
}

/// Growable output buffer for encoding packets.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocates room for a packet of roughly `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.push(value as u8);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Fixed-width integers are written big-endian.
    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes the shortest encoding of `value`. Negative values always take
    /// five bytes.
    pub fn write_var_int(&mut self, value: i32) {
        let mut value = value as u32;
        loop {
            if value & !u32::from(SEGMENT_BITS) == 0 {
                self.buf.push(value as u8);
                return;
            }
            self.buf.push((value as u8 & SEGMENT_BITS) | CONTINUE_BIT);
            value >>= 7;
        }
    }

    /// Appends raw bytes with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The encoded bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
