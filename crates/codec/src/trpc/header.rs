use bytes::BufMut;

use crate::buffer::BufferExt;
use crate::error::ProtocolError;

use super::PROTOCOL;

/// Length of the fixed frame header.
pub const FIXED_HEADER_SIZE: usize = 16;

/// Frame magic.
pub const MAGIC: u16 = 0x930;

/// `data_frame_type` of a unary call.
pub const DATA_FRAME_UNARY: u8 = 0;
/// `data_frame_type` of a streaming call.
pub const DATA_FRAME_STREAM: u8 = 1;

/// Stream frame types carried in `stream_frame_type`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamFrameType {
    Unary,
    Init,
    Data,
    Feedback,
    Close,
}

impl StreamFrameType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unary),
            1 => Some(Self::Init),
            2 => Some(Self::Data),
            3 => Some(Self::Feedback),
            4 => Some(Self::Close),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Unary => 0,
            Self::Init => 1,
            Self::Data => 2,
            Self::Feedback => 3,
            Self::Close => 4,
        }
    }
}

/// The 16-byte header that starts every tRPC frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedHeader {
    pub data_frame_type: u8,
    pub stream_frame_type: StreamFrameType,
    pub total_size: u32,
    pub pb_header_size: u16,
    pub stream_id: u32,
}

impl FixedHeader {
    /// Parses the header from the front of `bytes` without consuming it.
    ///
    /// Returns `Ok(None)` while fewer than [`FIXED_HEADER_SIZE`] bytes are available.
    pub fn peek(bytes: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Ok(None);
        }
        let magic = bytes.peek_be_u16(0).unwrap_or_default();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic {
                protocol: PROTOCOL,
                expected: u32::from(MAGIC),
                found: u32::from(magic),
            });
        }
        let data_frame_type = bytes.peek_u8(2).unwrap_or_default();
        let raw_stream_type = bytes.peek_u8(3).unwrap_or_default();
        let stream_frame_type = StreamFrameType::from_u8(raw_stream_type).ok_or_else(|| {
            ProtocolError::malformed(
                PROTOCOL,
                format!("unknown stream frame type {raw_stream_type}"),
            )
        })?;
        let header = Self {
            data_frame_type,
            stream_frame_type,
            total_size: bytes.peek_be_u32(4).unwrap_or_default(),
            pb_header_size: bytes.peek_be_u16(8).unwrap_or_default(),
            stream_id: bytes.peek_be_u32(10).unwrap_or_default(),
        };
        header.validate()?;
        Ok(Some(header))
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let minimum = FIXED_HEADER_SIZE as u64 + u64::from(self.pb_header_size);
        if u64::from(self.total_size) < minimum {
            return Err(ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: u64::from(self.total_size),
                reason: "frame shorter than its headers",
            });
        }
        if self.total_size > super::MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: u64::from(self.total_size),
                reason: "frame exceeds maximum size",
            });
        }
        Ok(())
    }

    pub const fn is_unary(&self) -> bool {
        matches!(self.stream_frame_type, StreamFrameType::Unary)
    }

    /// Bytes needed before the protocol header can be parsed.
    pub const fn unary_header_end(&self) -> usize {
        FIXED_HEADER_SIZE + self.pb_header_size as usize
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.data_frame_type);
        buf.put_u8(self.stream_frame_type.as_u8());
        buf.put_u32(self.total_size);
        buf.put_u16(self.pb_header_size);
        buf.put_u32(self.stream_id);
        buf.put_u16(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unary(total_size: u32, pb_header_size: u16) -> FixedHeader {
        FixedHeader {
            data_frame_type: DATA_FRAME_UNARY,
            stream_frame_type: StreamFrameType::Unary,
            total_size,
            pb_header_size,
            stream_id: 0,
        }
    }

    #[test]
    fn header_layout_is_sixteen_bytes() {
        let mut buf = Vec::new();
        unary(40, 10).write(&mut buf);
        assert_eq!(buf.len(), FIXED_HEADER_SIZE);
        assert_eq!(&buf[..2], &[0x09, 0x30]);
        assert_eq!(FixedHeader::peek(&buf).unwrap(), Some(unary(40, 10)));
    }

    #[test]
    fn short_input_waits() {
        assert_eq!(FixedHeader::peek(&[0x09, 0x30, 0, 0]).unwrap(), None);
    }

    #[test]
    fn total_smaller_than_headers_is_rejected() {
        let mut buf = Vec::new();
        unary(20, 10).write(&mut buf);
        assert!(matches!(
            FixedHeader::peek(&buf),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn unknown_stream_frame_type_is_rejected() {
        let mut buf = Vec::new();
        unary(16, 0).write(&mut buf);
        buf[3] = 9;
        assert!(FixedHeader::peek(&buf).is_err());
    }
}
