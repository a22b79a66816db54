//! Peek helpers for the receive buffer.
//!
//! Codecs inspect fixed headers before deciding whether a full frame is
//! buffered. Every helper here reads at an offset without advancing the
//! buffer, so a stage that returns `WaitForData` leaves the bytes untouched
//! for the next attempt.

use bytes::BytesMut;

/// Non-consuming integer reads over a byte buffer.
///
/// All methods return `None` when fewer than `offset + size_of::<T>()` bytes
/// are available.
pub trait BufferExt {
    /// Reads one byte at `offset`.
    fn peek_u8(&self, offset: usize) -> Option<u8>;
    /// Reads a big-endian `u16` at `offset`.
    fn peek_be_u16(&self, offset: usize) -> Option<u16>;
    /// Reads a big-endian `u32` at `offset`.
    fn peek_be_u32(&self, offset: usize) -> Option<u32>;
    /// Reads a big-endian `u64` at `offset`.
    fn peek_be_u64(&self, offset: usize) -> Option<u64>;
    /// Reads a little-endian `u32` at `offset`.
    fn peek_le_u32(&self, offset: usize) -> Option<u32>;
}

fn window<const N: usize>(bytes: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    bytes.get(offset..end)?.try_into().ok()
}

impl BufferExt for [u8] {
    fn peek_u8(&self, offset: usize) -> Option<u8> {
        self.get(offset).copied()
    }

    fn peek_be_u16(&self, offset: usize) -> Option<u16> {
        window(self, offset).map(u16::from_be_bytes)
    }

    fn peek_be_u32(&self, offset: usize) -> Option<u32> {
        window(self, offset).map(u32::from_be_bytes)
    }

    fn peek_be_u64(&self, offset: usize) -> Option<u64> {
        window(self, offset).map(u64::from_be_bytes)
    }

    fn peek_le_u32(&self, offset: usize) -> Option<u32> {
        window(self, offset).map(u32::from_le_bytes)
    }
}

impl BufferExt for BytesMut {
    fn peek_u8(&self, offset: usize) -> Option<u8> {
        self[..].peek_u8(offset)
    }

    fn peek_be_u16(&self, offset: usize) -> Option<u16> {
        self[..].peek_be_u16(offset)
    }

    fn peek_be_u32(&self, offset: usize) -> Option<u32> {
        self[..].peek_be_u32(offset)
    }

    fn peek_be_u64(&self, offset: usize) -> Option<u64> {
        self[..].peek_be_u64(offset)
    }

    fn peek_le_u32(&self, offset: usize) -> Option<u32> {
        self[..].peek_le_u32(offset)
    }
}
