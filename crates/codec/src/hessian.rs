//! Hessian2 string encoding used by Dubbo request and error bodies.
//!
//! Only the string forms are implemented: compact (`0x00..=0x1f`), medium
//! (`0x30..=0x33`), chunked (`R` followed by a final `S`) and null (`N`).
//! Lengths count UTF-16 code units, so characters outside the basic plane
//! count twice.

use bytes::BufMut;

use crate::error::ProtocolError;

const PROTOCOL: &str = "hessian2";

const COMPACT_MAX: usize = 0x1f;
const MEDIUM_MAX: usize = 0x3ff;
const CHUNK_MAX: usize = 0xffff;

const TAG_MEDIUM_BASE: u8 = 0x30;
const TAG_CHUNK: u8 = b'R';
const TAG_FINAL: u8 = b'S';
const TAG_NULL: u8 = b'N';

/// Byte length of a UTF-8 sequence spanning `units` UTF-16 code units.
fn utf8_span(bytes: &[u8], units: usize) -> Result<usize, ProtocolError> {
    let mut offset = 0;
    let mut remaining = units;
    while remaining > 0 {
        let lead = *bytes
            .get(offset)
            .ok_or_else(|| ProtocolError::malformed(PROTOCOL, "truncated string"))?;
        let (width, count) = match lead {
            0x00..=0x7f => (1, 1),
            0xc0..=0xdf => (2, 1),
            0xe0..=0xef => (3, 1),
            0xf0..=0xf7 => (4, 2),
            _ => return Err(ProtocolError::malformed(PROTOCOL, "invalid utf-8 lead byte")),
        };
        if count > remaining {
            return Err(ProtocolError::malformed(PROTOCOL, "surrogate pair split by length"));
        }
        offset += width;
        remaining -= count;
    }
    if offset > bytes.len() {
        return Err(ProtocolError::malformed(PROTOCOL, "truncated string"));
    }
    Ok(offset)
}

/// Reads one string value from the front of `bytes`.
///
/// Returns the string (`None` for a Hessian null) and the number of bytes
/// consumed.
pub fn read_string(bytes: &[u8]) -> Result<(Option<String>, usize), ProtocolError> {
    let mut offset = 0;
    let mut raw = Vec::new();
    loop {
        let tag = *bytes
            .get(offset)
            .ok_or_else(|| ProtocolError::malformed(PROTOCOL, "missing string tag"))?;
        let (units, header, last) = match tag {
            TAG_NULL if offset == 0 => return Ok((None, 1)),
            0x00..=0x1f => (usize::from(tag), 1, true),
            0x30..=0x33 => {
                let low = *bytes
                    .get(offset + 1)
                    .ok_or_else(|| ProtocolError::malformed(PROTOCOL, "truncated length"))?;
                ((usize::from(tag - TAG_MEDIUM_BASE) << 8) | usize::from(low), 2, true)
            }
            TAG_FINAL | TAG_CHUNK => {
                let high = bytes.get(offset + 1);
                let low = bytes.get(offset + 2);
                let (Some(&high), Some(&low)) = (high, low) else {
                    return Err(ProtocolError::malformed(PROTOCOL, "truncated length"));
                };
                (
                    usize::from(u16::from_be_bytes([high, low])),
                    3,
                    tag == TAG_FINAL,
                )
            }
            other => {
                return Err(ProtocolError::malformed(
                    PROTOCOL,
                    format!("expected string, found tag 0x{other:02x}"),
                ));
            }
        };
        offset += header;
        let body = bytes.get(offset..).unwrap_or_default();
        let span = utf8_span(body, units)?;
        raw.extend_from_slice(&body[..span]);
        offset += span;
        if last {
            break;
        }
    }
    let text = String::from_utf8(raw)
        .map_err(|_| ProtocolError::malformed(PROTOCOL, "string is not valid utf-8"))?;
    Ok((Some(text), offset))
}

/// Appends `value` as a Hessian2 string.
pub fn write_string(buf: &mut impl BufMut, value: &str) {
    let units = value.encode_utf16().count();
    if units <= COMPACT_MAX {
        buf.put_u8(units as u8);
        buf.put_slice(value.as_bytes());
        return;
    }
    if units <= MEDIUM_MAX {
        buf.put_u8(TAG_MEDIUM_BASE + (units >> 8) as u8);
        buf.put_u8(units as u8);
        buf.put_slice(value.as_bytes());
        return;
    }

    let mut rest = value;
    loop {
        let mut chunk_units = 0;
        let mut chunk_bytes = 0;
        for ch in rest.chars() {
            if chunk_units + ch.len_utf16() > CHUNK_MAX {
                break;
            }
            chunk_units += ch.len_utf16();
            chunk_bytes += ch.len_utf8();
        }
        let last = chunk_bytes == rest.len();
        buf.put_u8(if last { TAG_FINAL } else { TAG_CHUNK });
        buf.put_u16(chunk_units as u16);
        buf.put_slice(&rest.as_bytes()[..chunk_bytes]);
        if last {
            break;
        }
        rest = &rest[chunk_bytes..];
    }
}

/// Appends a Hessian2 null.
pub fn write_null(buf: &mut impl BufMut) {
    buf.put_u8(TAG_NULL);
}
