#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! Codec contract and wire codecs for the meta protocol proxy.
//!
//! The proxy engine never looks at protocol bytes directly. Every wire
//! protocol implements [`Codec`], which turns a growing receive buffer into
//! one [`Metadata`] per message and turns metadata plus a [`Mutation`] back
//! into bytes. Three protocols are provided:
//!
//! - [`BrpcCodec`] for Baidu `baidu_std`,
//! - [`TrpcCodec`] for tRPC unary and streaming calls,
//! - [`DubboCodec`] for Dubbo with Hessian2 bodies.
//!
//! [`CodecKind`] resolves a configured protocol name to a codec factory.
//!
//! # Examples
//!
//! Decode a Brpc request delivered in two chunks:
//!
//! ```
//! use bytes::BytesMut;
//! use codec::{CodecKind, DecodeStatus, Metadata, MessageType};
//!
//! let frame = codec::frames::brpc::request(7, "EchoService", "Echo", b"hello");
//! let mut codec = CodecKind::Brpc.new_codec();
//! let mut metadata = Metadata::new(MessageType::Request);
//!
//! let mut buffer = BytesMut::from(&frame[..10]);
//! assert_eq!(codec.decode(&mut buffer, &mut metadata).unwrap(), DecodeStatus::WaitForData);
//!
//! buffer.extend_from_slice(&frame[10..]);
//! assert_eq!(codec.decode(&mut buffer, &mut metadata).unwrap(), DecodeStatus::Done);
//! assert_eq!(metadata.request_id(), 7);
//! assert_eq!(metadata.get_string("method"), Some("Echo"));
//! assert_eq!(metadata.origin_message().len(), frame.len());
//! ```

mod brpc;
mod buffer;
mod codec;
mod dubbo;
mod error;
#[cfg(feature = "framed")]
mod framed;
pub mod hessian;
mod message;
mod metadata;
mod mutation;
pub mod pb;
mod trpc;
mod value;

pub use brpc::BrpcCodec;
pub use buffer::BufferExt;
pub use codec::{Codec, CodecFactory, CodecKind, UnknownCodec};
pub use dubbo::DubboCodec;
pub use error::{AppError, ErrorType, ProtocolError};
#[cfg(feature = "framed")]
pub use framed::MessageFramer;
pub use message::{DecodeStatus, MessageType, ResponseStatus};
pub use metadata::{HEADER_REAL_SERVER_ADDRESS, Metadata};
pub use mutation::Mutation;
pub use trpc::TrpcCodec;
pub use value::{OpaqueHandle, Value};

/// Protocol-specific error codes written by [`Codec::on_error`].
pub mod error_codes {
    pub use crate::brpc::error_code as brpc;
    pub use crate::dubbo::{Status as DubboStatus, error_status as dubbo};
    pub use crate::trpc::error_code as trpc;
}

/// Wire frame builders for tests and tooling.
#[doc(hidden)]
pub mod frames {
    pub use crate::brpc::frames as brpc;
    pub use crate::dubbo::frames as dubbo;
    pub use crate::trpc::frames as trpc;
}
