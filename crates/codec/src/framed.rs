//! crates/codec/src/framed.rs
//!
//! Async adapter that drives any [`Codec`] through tokio-util's framing.
//!
//! [`MessageFramer`] implements [`tokio_util::codec::Decoder`] yielding one
//! [`Metadata`] per complete message, and [`tokio_util::codec::Encoder`]
//! writing a message's origin bytes. It lets clients and test harnesses read
//! whole protocol messages off a socket without going through the proxy
//! engine.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::Codec;
use crate::message::{DecodeStatus, MessageType};
use crate::metadata::Metadata;

/// Frames a byte stream into decoded messages.
///
/// # Example
///
/// ```ignore
/// use futures::StreamExt;
/// use tokio_util::codec::FramedRead;
/// use codec::{CodecKind, MessageFramer, MessageType};
///
/// let mut frames = FramedRead::new(socket, MessageFramer::new(CodecKind::Trpc.new_codec(), MessageType::Response));
/// while let Some(metadata) = frames.next().await {
///     println!("response {}", metadata?.request_id());
/// }
/// ```
pub struct MessageFramer {
    codec: Box<dyn Codec>,
    direction: MessageType,
    pending: Option<Metadata>,
}

impl MessageFramer {
    /// Wraps `codec`, seeding every decode with `direction`.
    #[must_use]
    pub fn new(codec: Box<dyn Codec>, direction: MessageType) -> Self {
        Self {
            codec,
            direction,
            pending: None,
        }
    }

    /// Returns the direction messages are decoded as.
    #[must_use]
    pub const fn direction(&self) -> MessageType {
        self.direction
    }
}

impl std::fmt::Debug for MessageFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFramer")
            .field("direction", &self.direction)
            .field("in_progress", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl Decoder for MessageFramer {
    type Item = Metadata;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let direction = self.direction;
        let metadata = self
            .pending
            .get_or_insert_with(|| Metadata::new(direction));
        match self.codec.decode(src, metadata)? {
            DecodeStatus::WaitForData => Ok(None),
            DecodeStatus::Done => Ok(self.pending.take()),
        }
    }
}

impl Encoder<Metadata> for MessageFramer {
    type Error = io::Error;

    fn encode(&mut self, mut item: Metadata, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.unsplit(item.take_origin_message());
        Ok(())
    }
}

impl Encoder<&[u8]> for MessageFramer {
    type Error = io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CodecKind;
    use crate::brpc::frames;

    #[test]
    fn decoder_yields_one_message_per_frame() {
        let mut framer = MessageFramer::new(CodecKind::Brpc.new_codec(), MessageType::Request);
        let mut src = frames::request(1, "S", "M", b"a");
        src.extend_from_slice(&frames::request(2, "S", "M", b"b"));

        let first = framer.decode(&mut src).unwrap().unwrap();
        let second = framer.decode(&mut src).unwrap().unwrap();
        assert_eq!((first.request_id(), second.request_id()), (1, 2));
        assert!(framer.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn malformed_input_is_invalid_data() {
        let mut framer = MessageFramer::new(CodecKind::Brpc.new_codec(), MessageType::Request);
        let mut src = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        let err = framer.decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encoder_writes_origin_bytes() {
        let mut framer = MessageFramer::new(CodecKind::Brpc.new_codec(), MessageType::Request);
        let frame = frames::request(3, "S", "M", b"payload");
        let mut src = frame.clone();
        let metadata = framer.decode(&mut src).unwrap().unwrap();

        let mut dst = BytesMut::new();
        framer.encode(metadata, &mut dst).unwrap();
        assert_eq!(dst, frame);
    }
}
