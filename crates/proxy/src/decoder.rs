//! crates/proxy/src/decoder.rs
//!
//! Protocol-agnostic framing state machine. A [`Decoder`] drives one
//! [`Codec`] over an accumulating buffer and hands every completed message to
//! a [`DecoderDelegate`].

use bytes::BytesMut;
use codec::{Codec, DecodeStatus, MessageType, Metadata, Mutation, ProtocolError};
use tracing::{debug, trace};

/// Progress of the message currently being decoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolState {
    /// Bytes of the current message are still being collected.
    OnDecodeStreamData,
    /// The codec needs more bytes before it can make progress.
    WaitForData,
    /// A complete message was decoded.
    Done,
}

/// Receiver of decoded messages.
pub trait DecoderDelegate {
    /// Per-message handle returned by [`DecoderDelegate::new_stream`].
    type Stream;

    /// Codec used to parse the bytes.
    fn codec(&mut self) -> &mut dyn Codec;

    /// A heartbeat arrived. Heartbeats never reach a filter chain.
    fn on_heartbeat(&mut self, metadata: Metadata);

    /// Registers a decoded message and returns its handle.
    fn new_stream(&mut self, metadata: Metadata, mutation: Mutation) -> Self::Stream;

    /// Processes a message registered by [`DecoderDelegate::new_stream`].
    fn on_stream_decoded(&mut self, stream: Self::Stream);
}

/// Decode context of the message in flight.
#[derive(Debug)]
struct StateMachine {
    metadata: Metadata,
    state: ProtocolState,
}

impl StateMachine {
    fn new(direction: MessageType) -> Self {
        Self {
            metadata: Metadata::new(direction),
            state: ProtocolState::OnDecodeStreamData,
        }
    }

    fn run<D: DecoderDelegate>(
        &mut self,
        buffer: &mut BytesMut,
        delegate: &mut D,
    ) -> Result<ProtocolState, ProtocolError> {
        self.state = match delegate.codec().decode(buffer, &mut self.metadata)? {
            DecodeStatus::WaitForData => ProtocolState::WaitForData,
            DecodeStatus::Done => ProtocolState::Done,
        };
        Ok(self.state)
    }
}

/// Incremental decoder for one byte stream.
///
/// `direction` seeds every message's metadata with the expected message type
/// so a codec can tell requests from responses on protocols whose header does
/// not say.
#[derive(Debug)]
pub struct Decoder {
    direction: MessageType,
    state_machine: Option<StateMachine>,
}

impl Decoder {
    /// Creates a decoder for requests ([`MessageType::Request`]) or responses
    /// ([`MessageType::Response`]).
    #[must_use]
    pub fn new(direction: MessageType) -> Self {
        Self {
            direction,
            state_machine: None,
        }
    }

    /// Direction the decoder was created for.
    #[must_use]
    pub const fn direction(&self) -> MessageType {
        self.direction
    }

    /// Returns `true` while a message is partially decoded.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.state_machine.is_some()
    }

    /// Opens a decode context for the next message.
    ///
    /// # Panics
    ///
    /// Panics when a message is already being decoded.
    pub fn start(&mut self) {
        assert!(
            self.state_machine.is_none(),
            "decoder already has a message in flight"
        );
        self.state_machine = Some(StateMachine::new(self.direction));
    }

    /// Drops the partially decoded message, if any.
    pub fn reset(&mut self) {
        self.state_machine = None;
    }

    /// Decodes at most one message from `buffer`.
    ///
    /// Returns `true` (underflow) when the buffer needs more bytes before the
    /// next message can complete, including when a message completed and the
    /// buffer is now empty.
    pub fn on_data<D: DecoderDelegate>(
        &mut self,
        buffer: &mut BytesMut,
        delegate: &mut D,
    ) -> Result<bool, ProtocolError> {
        if self.state_machine.is_none() {
            self.start();
        }
        let Some(machine) = self.state_machine.as_mut() else {
            return Ok(true);
        };

        trace!(
            target: "meta_proxy::decoder",
            direction = self.direction.as_str(),
            buffered = buffer.len(),
            "decoding"
        );
        let state = match machine.run(buffer, delegate) {
            Ok(state) => state,
            Err(error) => {
                self.reset();
                return Err(error);
            }
        };

        match state {
            ProtocolState::WaitForData | ProtocolState::OnDecodeStreamData => Ok(true),
            ProtocolState::Done => {
                let Some(machine) = self.state_machine.take() else {
                    return Ok(true);
                };
                self.complete(machine.metadata, delegate);
                Ok(buffer.is_empty())
            }
        }
    }

    fn complete<D: DecoderDelegate>(&self, metadata: Metadata, delegate: &mut D) {
        debug!(
            target: "meta_proxy::decoder",
            message_type = metadata.message_type().as_str(),
            request_id = metadata.request_id(),
            size = metadata.message_size(),
            "message decoded"
        );
        if metadata.message_type() == MessageType::Heartbeat {
            delegate.on_heartbeat(metadata);
            return;
        }
        let stream = delegate.new_stream(metadata, Mutation::new());
        delegate.on_stream_decoded(stream);
    }
}
