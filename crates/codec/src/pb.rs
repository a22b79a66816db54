//! Minimal protobuf wire-format reader and writer.
//!
//! # Overview
//!
//! The Brpc meta and the tRPC protocol headers are protobuf messages. Only a
//! handful of fields matter to the proxy, so instead of generated types the
//! codecs walk the wire format directly with [`FieldReader`] and re-emit
//! the fields they do not touch verbatim with [`Field::write_to`].
//!
//! # Design
//!
//! Varints use the standard base-128 little-endian grouping, capped at ten
//! bytes. Unknown field numbers are preserved, unknown wire types (the
//! deprecated group encodings) are rejected.

use bytes::BufMut;

use crate::error::ProtocolError;

const MAX_VARINT_LEN: usize = 10;

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Decodes one varint from the front of `bytes`, returning the value and the rest.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, &[u8]), ProtocolError> {
    let mut value = 0u64;
    for (index, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok((value, &bytes[index + 1..]));
        }
    }
    if bytes.len() >= MAX_VARINT_LEN {
        Err(ProtocolError::Protobuf("varint longer than ten bytes"))
    } else {
        Err(ProtocolError::Protobuf("truncated varint"))
    }
}

/// Appends `value` as a varint.
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn put_tag(buf: &mut impl BufMut, field: u32, wire_type: u32) {
    put_varint(buf, u64::from((field << 3) | wire_type));
}

/// Appends a varint field.
pub fn put_varint_field(buf: &mut impl BufMut, field: u32, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

/// Appends a signed `int32` field using protobuf's sign-extended encoding.
pub fn put_int32_field(buf: &mut impl BufMut, field: u32, value: i32) {
    put_varint_field(buf, field, i64::from(value) as u64);
}

/// Appends a length-delimited field.
pub fn put_bytes_field(buf: &mut impl BufMut, field: u32, value: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Appends a `map<string, string|bytes>` entry.
pub fn put_map_entry(buf: &mut impl BufMut, field: u32, key: &str, value: &[u8]) {
    let mut entry = Vec::with_capacity(key.len() + value.len() + 6);
    put_bytes_field(&mut entry, 1, key.as_bytes());
    put_bytes_field(&mut entry, 2, value);
    put_bytes_field(buf, field, &entry);
}

/// One decoded field value, borrowing length-delimited payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Field<'a> {
    /// Wire type 0.
    Varint(u64),
    /// Wire type 1.
    Fixed64(u64),
    /// Wire type 2.
    Bytes(&'a [u8]),
    /// Wire type 5.
    Fixed32(u32),
}

impl<'a> Field<'a> {
    /// Returns the varint payload.
    #[must_use]
    pub const fn as_u64(self) -> Option<u64> {
        match self {
            Self::Varint(value) | Self::Fixed64(value) => Some(value),
            Self::Fixed32(value) => Some(value as u64),
            Self::Bytes(_) => None,
        }
    }

    /// Returns the payload interpreted as a protobuf `int32`.
    #[must_use]
    pub const fn as_i32(self) -> Option<i32> {
        match self {
            Self::Varint(value) => Some(value as i64 as i32),
            Self::Fixed32(value) => Some(value as i32),
            _ => None,
        }
    }

    /// Returns the length-delimited payload.
    #[must_use]
    pub const fn as_bytes(self) -> Option<&'a [u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the length-delimited payload as UTF-8, lossily.
    #[must_use]
    pub fn as_string(self) -> Option<String> {
        self.as_bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Re-emits this value under `field`.
    pub fn write_to(self, buf: &mut impl BufMut, field: u32) {
        match self {
            Self::Varint(value) => put_varint_field(buf, field, value),
            Self::Fixed64(value) => {
                put_tag(buf, field, WIRE_FIXED64);
                buf.put_u64_le(value);
            }
            Self::Bytes(bytes) => put_bytes_field(buf, field, bytes),
            Self::Fixed32(value) => {
                put_tag(buf, field, WIRE_FIXED32);
                buf.put_u32_le(value);
            }
        }
    }
}

/// Iterates over the fields of an encoded message.
#[derive(Clone, Debug)]
pub struct FieldReader<'a> {
    rest: &'a [u8],
}

impl<'a> FieldReader<'a> {
    /// Starts reading `bytes`.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.rest.len() < len {
            return Err(ProtocolError::Protobuf("field extends past end of message"));
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    /// Returns the next `(field number, value)` pair, or `None` at the end.
    pub fn next_field(&mut self) -> Result<Option<(u32, Field<'a>)>, ProtocolError> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let (key, rest) = decode_varint(self.rest)?;
        self.rest = rest;
        let field = u32::try_from(key >> 3)
            .map_err(|_| ProtocolError::Protobuf("field number out of range"))?;
        if field == 0 {
            return Err(ProtocolError::Protobuf("field number zero"));
        }
        let value = match (key & 0x7) as u32 {
            WIRE_VARINT => {
                let (value, rest) = decode_varint(self.rest)?;
                self.rest = rest;
                Field::Varint(value)
            }
            WIRE_FIXED64 => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Field::Fixed64(u64::from_le_bytes(raw))
            }
            WIRE_LEN => {
                let (len, rest) = decode_varint(self.rest)?;
                self.rest = rest;
                let len = usize::try_from(len)
                    .map_err(|_| ProtocolError::Protobuf("length out of range"))?;
                Field::Bytes(self.take(len)?)
            }
            WIRE_FIXED32 => {
                let bytes = self.take(4)?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Field::Fixed32(u32::from_le_bytes(raw))
            }
            _ => return Err(ProtocolError::Protobuf("unsupported wire type")),
        };
        Ok(Some((field, value)))
    }
}

/// Splits an encoded map entry into its key and value payloads.
pub fn decode_map_entry(entry: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    let mut reader = FieldReader::new(entry);
    let mut key: &[u8] = &[];
    let mut value: &[u8] = &[];
    while let Some((field, data)) = reader.next_field()? {
        match (field, data) {
            (1, Field::Bytes(bytes)) => key = bytes,
            (2, Field::Bytes(bytes)) => value = bytes,
            _ => {}
        }
    }
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let (decoded, rest) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn known_varint_encoding() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, [0xac, 0x02]);
    }

    #[test]
    fn truncated_varint_is_rejected() {
        assert!(matches!(
            decode_varint(&[0x80, 0x80]),
            Err(ProtocolError::Protobuf("truncated varint"))
        ));
    }

    #[test]
    fn overlong_varint_is_rejected() {
        assert!(decode_varint(&[0xff; 11]).is_err());
    }

    #[test]
    fn negative_int32_reads_back() {
        let mut buf = Vec::new();
        put_int32_field(&mut buf, 1, -5);
        let mut reader = FieldReader::new(&buf);
        let (field, value) = reader.next_field().unwrap().unwrap();
        assert_eq!(field, 1);
        assert_eq!(value.as_i32(), Some(-5));
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn reader_walks_mixed_fields() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, 4, 99);
        put_bytes_field(&mut buf, 2, b"method");
        Field::Fixed32(7).write_to(&mut buf, 6);
        Field::Fixed64(8).write_to(&mut buf, 7);

        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.next_field().unwrap(), Some((4, Field::Varint(99))));
        assert_eq!(
            reader.next_field().unwrap(),
            Some((2, Field::Bytes(b"method")))
        );
        assert_eq!(reader.next_field().unwrap(), Some((6, Field::Fixed32(7))));
        assert_eq!(reader.next_field().unwrap(), Some((7, Field::Fixed64(8))));
        assert_eq!(reader.next_field().unwrap(), None);
    }

    #[test]
    fn length_past_end_is_rejected() {
        let buf = [0x12, 0x05, b'a', b'b'];
        let mut reader = FieldReader::new(&buf);
        assert!(reader.next_field().is_err());
    }

    #[test]
    fn group_wire_type_is_rejected() {
        let buf = [0x0b];
        assert!(FieldReader::new(&buf).next_field().is_err());
    }

    #[test]
    fn map_entry_round_trip() {
        let mut buf = Vec::new();
        put_map_entry(&mut buf, 9, "tenant", b"blue");
        let mut reader = FieldReader::new(&buf);
        let (field, value) = reader.next_field().unwrap().unwrap();
        assert_eq!(field, 9);
        let (key, val) = decode_map_entry(value.as_bytes().unwrap()).unwrap();
        assert_eq!(key, b"tenant");
        assert_eq!(val, b"blue");
    }
}
