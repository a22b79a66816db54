//! Response-direction decoding shared by request correlation, multiplexed
//! handlers, duplex streams and mirrored requests.

use bytes::BytesMut;
use codec::{Codec, MessageType, Metadata, Mutation, ProtocolError};
use tracing::trace;

use crate::decoder::{Decoder, DecoderDelegate};

struct Collect<'a> {
    codec: &'a mut dyn Codec,
    decoded: &'a mut Vec<Metadata>,
}

impl DecoderDelegate for Collect<'_> {
    type Stream = Metadata;

    fn codec(&mut self) -> &mut dyn Codec {
        self.codec
    }

    fn on_heartbeat(&mut self, metadata: Metadata) {
        trace!(
            target: "meta_proxy::decoder",
            request_id = metadata.request_id(),
            "dropping upstream heartbeat"
        );
    }

    fn new_stream(&mut self, metadata: Metadata, _mutation: Mutation) -> Metadata {
        metadata
    }

    fn on_stream_decoded(&mut self, metadata: Metadata) {
        self.decoded.push(metadata);
    }
}

/// Buffer, decoder and codec for one upstream byte stream.
pub(crate) struct ResponseDecoder {
    decoder: Decoder,
    codec: Box<dyn Codec>,
    buffer: BytesMut,
}

impl ResponseDecoder {
    pub(crate) fn new(codec: Box<dyn Codec>) -> Self {
        Self {
            decoder: Decoder::new(MessageType::Response),
            codec,
            buffer: BytesMut::new(),
        }
    }

    pub(crate) fn codec_mut(&mut self) -> &mut dyn Codec {
        self.codec.as_mut()
    }

    /// Moves `data` into the internal buffer and decodes until one message
    /// completes or more bytes are needed.
    pub(crate) fn decode_one(
        &mut self,
        data: &mut BytesMut,
    ) -> Result<Option<Metadata>, ProtocolError> {
        self.buffer.unsplit(data.split());
        let mut decoded = Vec::with_capacity(1);
        loop {
            let underflow = self.decoder.on_data(
                &mut self.buffer,
                &mut Collect {
                    codec: self.codec.as_mut(),
                    decoded: &mut decoded,
                },
            )?;
            if let Some(metadata) = decoded.pop() {
                return Ok(Some(metadata));
            }
            if underflow {
                return Ok(None);
            }
        }
    }

    /// Moves `data` into the internal buffer and decodes every complete
    /// message.
    pub(crate) fn decode_all(&mut self, data: &mut BytesMut) -> Result<Vec<Metadata>, ProtocolError> {
        self.buffer.unsplit(data.split());
        let mut decoded = Vec::new();
        loop {
            let underflow = self.decoder.on_data(
                &mut self.buffer,
                &mut Collect {
                    codec: self.codec.as_mut(),
                    decoded: &mut decoded,
                },
            )?;
            if underflow {
                return Ok(decoded);
            }
        }
    }
}
