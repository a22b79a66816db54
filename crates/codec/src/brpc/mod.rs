//! crates/codec/src/brpc/mod.rs
//!
//! Brpc (`baidu_std`) framing.
//!
//! Every frame starts with a 12-byte header:
//!
//! ```text
//! +------+--------------+--------------+
//! | PRPC | body_len BE32 | meta_len BE32 |
//! +------+--------------+--------------+
//! ```
//!
//! The body holds `meta_len` bytes of protobuf `RpcMeta` followed by the
//! payload and optional attachment. Requests and responses are correlated
//! by the meta's `correlation_id`.

mod meta;

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::buffer::BufferExt;
use crate::codec::Codec;
use crate::error::{AppError, ErrorType, ProtocolError};
use crate::message::{DecodeStatus, ResponseStatus};
use crate::metadata::Metadata;
use crate::mutation::Mutation;

use meta::RpcMeta;

const PROTOCOL: &str = "brpc";

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 12;

/// Frame magic.
pub const MAGIC: [u8; 4] = *b"PRPC";

/// Upper bound on a single frame body.
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Brpc error code written into locally generated error responses.
#[must_use]
pub const fn error_code(kind: ErrorType) -> i32 {
    match kind {
        ErrorType::RouteNotFound => 1019,
        ErrorType::ClusterNotFound => 1001,
        ErrorType::NoHealthyUpstream => 2005,
        ErrorType::BadResponse => 2002,
        ErrorType::Unspecified => 2001,
        ErrorType::OverLimit => 2004,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stage {
    DecodeHeader,
    DecodePayload { body_len: u32, meta_len: u32 },
}

/// Brpc codec.
#[derive(Debug)]
pub struct BrpcCodec {
    stage: Stage,
}

impl Default for BrpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BrpcCodec {
    /// Creates a codec waiting for a frame header.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stage: Stage::DecodeHeader,
        }
    }

    fn decode_header(buffer: &BytesMut) -> Result<Option<Stage>, ProtocolError> {
        if buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        if buffer[..4] != MAGIC {
            return Err(ProtocolError::InvalidMagic {
                protocol: PROTOCOL,
                expected: u32::from_be_bytes(MAGIC),
                found: buffer.peek_be_u32(0).unwrap_or_default(),
            });
        }
        let body_len = buffer.peek_be_u32(4).unwrap_or_default();
        let meta_len = buffer.peek_be_u32(8).unwrap_or_default();
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: u64::from(body_len),
                reason: "body exceeds maximum frame size",
            });
        }
        if meta_len > body_len {
            return Err(ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: u64::from(meta_len),
                reason: "meta longer than body",
            });
        }
        Ok(Some(Stage::DecodePayload { body_len, meta_len }))
    }

    fn to_metadata(meta: &RpcMeta, metadata: &mut Metadata) {
        metadata.set_request_id(meta.correlation_id as u64);
        metadata.put("compress_type", i64::from(meta.compress_type));
        if meta.attachment_size != 0 {
            metadata.put("attachment_size", i64::from(meta.attachment_size));
        }
        if let Some(request) = &meta.request {
            metadata.put_string("service", request.service_name.as_str());
            metadata.put_string("method", request.method_name.as_str());
            if let Some(log_id) = request.log_id {
                metadata.put("log_id", log_id);
            }
        }
        if let Some(response) = &meta.response {
            if response.error_code != 0 {
                metadata.set_response_status(ResponseStatus::Error);
                metadata.put("error_code", i64::from(response.error_code));
                metadata.put("error_text", response.error_text.as_str());
            }
        }
        for (key, value) in &meta.user_fields {
            metadata.put_string(key.as_str(), value.as_str());
        }
    }
}

impl Codec for BrpcCodec {
    fn decode(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut Metadata,
    ) -> Result<DecodeStatus, ProtocolError> {
        debug!(
            target: "meta_proxy::codec",
            protocol = PROTOCOL,
            available = buffer.len(),
            message_type = %metadata.message_type(),
            "decoding"
        );
        if self.stage == Stage::DecodeHeader {
            match Self::decode_header(buffer)? {
                Some(stage) => self.stage = stage,
                None => return Ok(DecodeStatus::WaitForData),
            }
        }
        let Stage::DecodePayload { body_len, meta_len } = self.stage else {
            return Ok(DecodeStatus::WaitForData);
        };
        let frame_len = HEADER_SIZE + body_len as usize;
        if buffer.len() < frame_len {
            return Ok(DecodeStatus::WaitForData);
        }

        let meta_end = HEADER_SIZE + meta_len as usize;
        let parsed = RpcMeta::parse(&buffer[HEADER_SIZE..meta_end]);
        self.stage = Stage::DecodeHeader;
        let meta = parsed?;

        Self::to_metadata(&meta, metadata);
        metadata.set_header_size(HEADER_SIZE);
        metadata.set_body_size(body_len as usize);
        metadata.set_origin_message(buffer.split_to(frame_len));
        Ok(DecodeStatus::Done)
    }

    fn encode(
        &mut self,
        metadata: &Metadata,
        mutation: &Mutation,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if buffer.is_empty() {
            return Err(ProtocolError::Unsupported {
                protocol: PROTOCOL,
                message_type: metadata.message_type(),
            });
        }
        if mutation.is_empty() {
            return Ok(());
        }
        let Some(Stage::DecodePayload { body_len, meta_len }) = Self::decode_header(buffer)? else {
            return Err(ProtocolError::malformed(PROTOCOL, "truncated frame header"));
        };
        let frame_len = HEADER_SIZE + body_len as usize;
        if buffer.len() < frame_len {
            return Err(ProtocolError::malformed(PROTOCOL, "truncated frame body"));
        }
        let meta_end = HEADER_SIZE + meta_len as usize;
        let merged = meta::merge_user_fields(&buffer[HEADER_SIZE..meta_end], mutation)?;
        let payload_len = (body_len - meta_len) as usize;
        let new_meta_len = u32::try_from(merged.len()).map_err(|_| ProtocolError::InvalidLength {
            protocol: PROTOCOL,
            length: merged.len() as u64,
            reason: "meta exceeds u32",
        })?;

        let mut out = BytesMut::with_capacity(HEADER_SIZE + merged.len() + payload_len);
        out.put_slice(&MAGIC);
        out.put_u32(new_meta_len + (body_len - meta_len));
        out.put_u32(new_meta_len);
        out.put_slice(&merged);
        out.put_slice(&buffer[meta_end..frame_len]);
        out.put_slice(&buffer[frame_len..]);
        *buffer = out;
        Ok(())
    }

    fn on_error(
        &mut self,
        metadata: &Metadata,
        error: &AppError,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let compress_type = metadata
            .get("compress_type")
            .and_then(|value| value.as_i64())
            .unwrap_or_default() as i32;
        let text = format!("from_mesh:{}", error.message());
        let meta = RpcMeta::encode_error(
            metadata.request_id() as i64,
            compress_type,
            error_code(error.kind()),
            &text,
        );
        let meta_len = u32::try_from(meta.len()).map_err(|_| ProtocolError::InvalidLength {
            protocol: PROTOCOL,
            length: meta.len() as u64,
            reason: "meta exceeds u32",
        })?;
        buffer.reserve(HEADER_SIZE + meta.len());
        buffer.put_slice(&MAGIC);
        buffer.put_u32(meta_len);
        buffer.put_u32(meta_len);
        buffer.put_slice(&meta);
        warn!(
            target: "meta_proxy::codec",
            protocol = PROTOCOL,
            error = %error,
            request_id = metadata.request_id(),
            len = buffer.len(),
            "wrote local error response"
        );
        Ok(())
    }
}

/// Frame builders shared by unit and integration tests.
#[doc(hidden)]
pub mod frames {
    use super::*;
    use crate::pb;

    /// Builds a request frame for `service`/`method`.
    #[must_use]
    pub fn request(correlation_id: u64, service: &str, method: &str, payload: &[u8]) -> BytesMut {
        let mut request = Vec::new();
        pb::put_bytes_field(&mut request, 1, service.as_bytes());
        pb::put_bytes_field(&mut request, 2, method.as_bytes());
        let mut meta = Vec::new();
        pb::put_bytes_field(&mut meta, 1, &request);
        pb::put_varint_field(&mut meta, 4, correlation_id);
        with_meta(&meta, payload)
    }

    /// Builds a successful response frame.
    #[must_use]
    pub fn response(correlation_id: u64, payload: &[u8]) -> BytesMut {
        let mut meta = Vec::new();
        pb::put_bytes_field(&mut meta, 2, &[]);
        pb::put_varint_field(&mut meta, 4, correlation_id);
        with_meta(&meta, payload)
    }

    /// Wraps an already encoded meta and payload in a frame header.
    #[must_use]
    pub fn with_meta(meta: &[u8], payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + meta.len() + payload.len());
        out.put_slice(&MAGIC);
        out.put_u32((meta.len() + payload.len()) as u32);
        out.put_u32(meta.len() as u32);
        out.put_slice(meta);
        out.put_slice(payload);
        out
    }
}
