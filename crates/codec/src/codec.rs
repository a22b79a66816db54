//! crates/codec/src/codec.rs
//!
//! The per-protocol contract plugged into the generic decoder, plus the
//! registry that resolves a configured protocol name to a codec factory.

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;

use crate::brpc::BrpcCodec;
use crate::dubbo::DubboCodec;
use crate::error::{AppError, ProtocolError};
use crate::message::DecodeStatus;
use crate::metadata::Metadata;
use crate::mutation::Mutation;
use crate::trpc::TrpcCodec;

/// Protocol-specific decode and encode operations.
///
/// A codec instance is bound to one byte stream. [`Codec::decode`] is called
/// repeatedly with the same accumulating buffer; partially parsed header
/// fields live inside the codec until a full message is available, after
/// which the codec resets to its header stage.
pub trait Codec: Send {
    /// Attempts to decode one message from the front of `buffer`.
    ///
    /// On [`DecodeStatus::Done`] the metadata carries the message type,
    /// request id and sizes, and the complete wire bytes of exactly one
    /// message have been moved out of `buffer` into
    /// [`Metadata::origin_message`]. On [`DecodeStatus::WaitForData`] no bytes
    /// of the pending message have been consumed.
    ///
    /// The caller seeds `metadata` with the expected direction
    /// ([`MessageType::Request`](crate::MessageType::Request) or
    /// [`MessageType::Response`](crate::MessageType::Response)) before the
    /// first call.
    fn decode(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut Metadata,
    ) -> Result<DecodeStatus, ProtocolError>;

    /// Produces the outgoing wire form of a message.
    ///
    /// When `buffer` holds the message's original bytes they are rewritten in
    /// place with the edits in `mutation`. When `buffer` is empty and the
    /// metadata type is a heartbeat, a heartbeat reply is written.
    fn encode(
        &mut self,
        metadata: &Metadata,
        mutation: &Mutation,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError>;

    /// Writes a protocol-native error response for `metadata`'s request.
    ///
    /// The reply carries the request's correlation id.
    fn on_error(
        &mut self,
        metadata: &Metadata,
        error: &AppError,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError>;
}

/// Creates codec instances. Each connection and each upstream response
/// decoder needs its own instance because codecs hold partial-parse state.
pub trait CodecFactory: Send + Sync {
    /// Returns a fresh codec.
    fn create_codec(&self) -> Box<dyn Codec>;
}

/// Wire protocols known to the proxy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CodecKind {
    /// Baidu `baidu_std` RPC.
    Brpc,
    /// Tencent tRPC, unary and streaming.
    Trpc,
    /// Apache Dubbo with Hessian2 bodies.
    Dubbo,
}

impl CodecKind {
    /// Every supported protocol.
    pub const ALL: [Self; 3] = [Self::Brpc, Self::Trpc, Self::Dubbo];

    /// Resolves a configured protocol name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    /// Returns the configuration name of the protocol.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Brpc => "brpc",
            Self::Trpc => "trpc",
            Self::Dubbo => "dubbo",
        }
    }

    /// Returns a fresh codec for this protocol.
    #[must_use]
    pub fn new_codec(self) -> Box<dyn Codec> {
        match self {
            Self::Brpc => Box::new(BrpcCodec::new()),
            Self::Trpc => Box::new(TrpcCodec::new()),
            Self::Dubbo => Box::new(DubboCodec::new()),
        }
    }
}

impl CodecFactory for CodecKind {
    fn create_codec(&self) -> Box<dyn Codec> {
        self.new_codec()
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a protocol name is not registered.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown codec '{0}'")]
pub struct UnknownCodec(pub String);

impl FromStr for CodecKind {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownCodec(s.to_owned()))
    }
}
