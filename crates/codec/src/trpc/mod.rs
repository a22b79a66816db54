//! crates/codec/src/trpc/mod.rs
//!
//! tRPC framing: a 16-byte fixed header, a protobuf protocol header and the
//! payload.
//!
//! ```text
//! 0      2      3       4          8        10          14     16
//! +------+------+-------+----------+--------+-----------+------+
//! |0x0930|data  |stream | total BE32| pb BE16| stream id | rsvd |
//! |      |frame |frame  |          | header | BE32      |      |
//! +------+------+-------+----------+--------+-----------+------+
//! ```
//!
//! Unary frames (stream frame type 0) carry a `RequestProtocol` or
//! `ResponseProtocol` header of `pb` bytes. Streaming frames carry a
//! frame-type specific meta and are correlated by stream id.

mod header;
mod protocol;

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::error::{AppError, ErrorType, ProtocolError};
use crate::message::{DecodeStatus, MessageType, ResponseStatus};
use crate::metadata::Metadata;
use crate::mutation::Mutation;

use header::{DATA_FRAME_STREAM, DATA_FRAME_UNARY, FIXED_HEADER_SIZE, FixedHeader, StreamFrameType};
use protocol::{StreamInit, UnaryHeader};

const PROTOCOL: &str = "trpc";

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

const CALL_TYPE_ONEWAY: u32 = 1;

/// `ret` code written into locally generated error responses.
#[must_use]
pub const fn error_code(kind: ErrorType) -> i32 {
    match kind {
        ErrorType::RouteNotFound => protocol::RET_SERVER_NOSERVICE,
        ErrorType::ClusterNotFound
        | ErrorType::NoHealthyUpstream
        | ErrorType::BadResponse
        | ErrorType::Unspecified
        | ErrorType::OverLimit => protocol::RET_SERVER_SYSTEM,
    }
}

#[derive(Clone, Debug)]
enum Parsed {
    Unary(UnaryHeader),
    Stream {
        message_type: MessageType,
        init: Option<StreamInit>,
    },
}

#[derive(Clone, Debug)]
enum Stage {
    DecodeFixedHeader,
    DecodeUnaryProtocolHeader(FixedHeader),
    DecodeStreamFrame(FixedHeader),
    DecodePayload(FixedHeader, Parsed),
}

/// tRPC codec for unary and streaming calls.
#[derive(Debug)]
pub struct TrpcCodec {
    stage: Stage,
}

impl Default for TrpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TrpcCodec {
    /// Creates a codec waiting for a fixed header.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stage: Stage::DecodeFixedHeader,
        }
    }

    /// Advances one stage. Returns `false` when more bytes are needed.
    fn step(&mut self, buffer: &BytesMut, response: bool) -> Result<bool, ProtocolError> {
        let next = match &self.stage {
            Stage::DecodeFixedHeader => {
                let Some(header) = FixedHeader::peek(buffer)? else {
                    return Ok(false);
                };
                trace!(target: "meta_proxy::codec", protocol = PROTOCOL, ?header, "fixed header");
                if header.is_unary() {
                    Stage::DecodeUnaryProtocolHeader(header)
                } else {
                    Stage::DecodeStreamFrame(header)
                }
            }
            Stage::DecodeUnaryProtocolHeader(header) => {
                if buffer.len() < header.unary_header_end() {
                    return Ok(false);
                }
                let raw = &buffer[FIXED_HEADER_SIZE..header.unary_header_end()];
                let parsed = if response {
                    UnaryHeader::parse_response(raw)?
                } else {
                    UnaryHeader::parse_request(raw)?
                };
                Stage::DecodePayload(*header, Parsed::Unary(parsed))
            }
            Stage::DecodeStreamFrame(header) => {
                let total = header.total_size as usize;
                if buffer.len() < total {
                    return Ok(false);
                }
                let frame = &buffer[FIXED_HEADER_SIZE..total];
                let parsed = match header.stream_frame_type {
                    StreamFrameType::Init => Parsed::Stream {
                        message_type: MessageType::StreamInit,
                        init: Some(StreamInit::parse(frame)?),
                    },
                    StreamFrameType::Data | StreamFrameType::Feedback => Parsed::Stream {
                        message_type: MessageType::StreamData,
                        init: None,
                    },
                    StreamFrameType::Close => Parsed::Stream {
                        message_type: if protocol::is_reset_close(frame)? {
                            MessageType::StreamCloseTwoWay
                        } else {
                            MessageType::StreamCloseOneWay
                        },
                        init: None,
                    },
                    StreamFrameType::Unary => {
                        return Err(ProtocolError::malformed(
                            PROTOCOL,
                            "unary frame routed to stream stage",
                        ));
                    }
                };
                Stage::DecodePayload(*header, parsed)
            }
            Stage::DecodePayload(header, _) => {
                if buffer.len() < header.total_size as usize {
                    return Ok(false);
                }
                return Ok(true);
            }
        };
        self.stage = next;
        Ok(true)
    }

    fn to_metadata(header: &FixedHeader, parsed: Parsed, metadata: &mut Metadata) {
        match parsed {
            Parsed::Unary(unary) => {
                metadata.set_request_id(u64::from(unary.request_id));
                if metadata.message_type().is_response() {
                    if unary.ret != 0 {
                        metadata.set_response_status(ResponseStatus::Error);
                    }
                    metadata.put("ret", i64::from(unary.ret));
                    metadata.put("func_ret", i64::from(unary.func_ret));
                    if !unary.error_msg.is_empty() {
                        metadata.put("error_msg", unary.error_msg);
                    }
                } else {
                    if unary.call_type == CALL_TYPE_ONEWAY {
                        metadata.set_message_type(MessageType::Oneway);
                    }
                    metadata.put_string("service", unary.callee);
                    metadata.put_string("method", unary.func);
                    metadata.put("caller", unary.caller);
                    metadata.put("timeout", unary.timeout);
                }
                metadata.put("call_type", unary.call_type);
                metadata.put("version", unary.version);
                metadata.put("message_type", unary.message_type);
                metadata.put("content_type", unary.content_type);
                metadata.put("content_encoding", unary.content_encoding);
                for (key, value) in unary.trans_info {
                    metadata.put_string(key, String::from_utf8_lossy(&value).into_owned());
                }
            }
            Parsed::Stream { message_type, init } => {
                metadata.set_message_type(message_type);
                metadata.set_stream_id(u64::from(header.stream_id));
                metadata.set_request_id(u64::from(header.stream_id));
                if let Some(init) = init {
                    metadata.put_string("service", init.callee);
                    metadata.put_string("method", init.func);
                    metadata.put("caller", init.caller);
                    for (key, value) in init.trans_info {
                        metadata.put_string(key, String::from_utf8_lossy(&value).into_owned());
                    }
                }
            }
        }
        metadata.set_header_size(FIXED_HEADER_SIZE + header.pb_header_size as usize);
        metadata.set_body_size(header.total_size as usize - metadata.header_size());
    }
}

impl Codec for TrpcCodec {
    fn decode(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut Metadata,
    ) -> Result<DecodeStatus, ProtocolError> {
        debug!(
            target: "meta_proxy::codec",
            protocol = PROTOCOL,
            available = buffer.len(),
            "decoding"
        );
        let response = metadata.message_type().is_response();
        loop {
            let progressed = match self.step(buffer, response) {
                Ok(progressed) => progressed,
                Err(err) => {
                    self.stage = Stage::DecodeFixedHeader;
                    return Err(err);
                }
            };
            if !progressed {
                return Ok(DecodeStatus::WaitForData);
            }
            if matches!(self.stage, Stage::DecodePayload(header, _) if buffer.len() >= header.total_size as usize)
            {
                break;
            }
        }

        let Stage::DecodePayload(header, parsed) =
            std::mem::replace(&mut self.stage, Stage::DecodeFixedHeader)
        else {
            return Ok(DecodeStatus::WaitForData);
        };
        Self::to_metadata(&header, parsed, metadata);
        metadata.set_origin_message(buffer.split_to(header.total_size as usize));
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
        let Some(header) = FixedHeader::peek(buffer)? else {
            return Err(ProtocolError::malformed(PROTOCOL, "truncated fixed header"));
        };
        if mutation.is_empty() || !header.is_unary() {
            return Ok(());
        }
        let total = header.total_size as usize;
        if buffer.len() < total {
            return Err(ProtocolError::malformed(PROTOCOL, "truncated frame"));
        }
        let merged = protocol::merge_trans_info(
            &buffer[FIXED_HEADER_SIZE..header.unary_header_end()],
            metadata.message_type().is_response(),
            mutation,
        )?;
        let pb_header_size = u16::try_from(merged.len()).map_err(|_| ProtocolError::InvalidLength {
            protocol: PROTOCOL,
            length: merged.len() as u64,
            reason: "protocol header exceeds u16",
        })?;
        let payload = &buffer[header.unary_header_end()..total];
        let new_total = FIXED_HEADER_SIZE + merged.len() + payload.len();
        let rewritten = FixedHeader {
            pb_header_size,
            total_size: u32::try_from(new_total).map_err(|_| ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: new_total as u64,
                reason: "frame exceeds u32",
            })?,
            ..header
        };

        let mut out = BytesMut::with_capacity(new_total + buffer.len() - total);
        rewritten.write(&mut out);
        out.put_slice(&merged);
        out.put_slice(payload);
        out.put_slice(&buffer[total..]);
        *buffer = out;
        Ok(())
    }

    fn on_error(
        &mut self,
        metadata: &Metadata,
        error: &AppError,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let ret = error_code(error.kind());
        let response = UnaryHeader {
            version: metadata.get_u32("version"),
            call_type: metadata.get_u32("call_type"),
            request_id: metadata.request_id() as u32,
            ret,
            func_ret: ret,
            error_msg: error.message().to_owned(),
            content_type: metadata.get_u32("content_type"),
            content_encoding: metadata.get_u32("content_encoding"),
            ..UnaryHeader::default()
        }
        .encode_response();
        let pb_header_size = u16::try_from(response.len()).map_err(|_| ProtocolError::InvalidLength {
            protocol: PROTOCOL,
            length: response.len() as u64,
            reason: "protocol header exceeds u16",
        })?;
        let header = FixedHeader {
            data_frame_type: DATA_FRAME_UNARY,
            stream_frame_type: StreamFrameType::Unary,
            total_size: (FIXED_HEADER_SIZE + response.len()) as u32,
            pb_header_size,
            stream_id: 0,
        };
        buffer.reserve(FIXED_HEADER_SIZE + response.len());
        header.write(buffer);
        buffer.put_slice(&response);
        Ok(())
    }
}

/// Frame builders shared by unit and integration tests.
#[doc(hidden)]
pub mod frames {
    use super::*;

    /// Builds a unary request frame.
    #[must_use]
    pub fn unary_request(request_id: u32, callee: &str, func: &str, body: &[u8]) -> BytesMut {
        let header = UnaryHeader {
            request_id,
            callee: callee.to_owned(),
            func: func.to_owned(),
            ..UnaryHeader::default()
        }
        .encode_request();
        unary_frame(&header, body)
    }

    /// Builds a unary response frame.
    #[must_use]
    pub fn unary_response(request_id: u32, ret: i32, body: &[u8]) -> BytesMut {
        let header = UnaryHeader {
            request_id,
            ret,
            ..UnaryHeader::default()
        }
        .encode_response();
        unary_frame(&header, body)
    }

    fn unary_frame(header: &[u8], body: &[u8]) -> BytesMut {
        let fixed = FixedHeader {
            data_frame_type: DATA_FRAME_UNARY,
            stream_frame_type: StreamFrameType::Unary,
            total_size: (FIXED_HEADER_SIZE + header.len() + body.len()) as u32,
            pb_header_size: header.len() as u16,
            stream_id: 0,
        };
        let mut out = BytesMut::new();
        fixed.write(&mut out);
        out.put_slice(header);
        out.put_slice(body);
        out
    }

    /// Builds a stream INIT frame.
    #[must_use]
    pub fn stream_init(stream_id: u32, callee: &str, func: &str) -> BytesMut {
        let meta = StreamInit {
            callee: callee.to_owned(),
            func: func.to_owned(),
            ..StreamInit::default()
        }
        .encode();
        stream_frame(stream_id, StreamFrameType::Init, &meta)
    }

    /// Builds a stream DATA frame.
    #[must_use]
    pub fn stream_data(stream_id: u32, data: &[u8]) -> BytesMut {
        stream_frame(stream_id, StreamFrameType::Data, data)
    }

    /// Builds a stream CLOSE frame, a reset when `reset` is set.
    #[must_use]
    pub fn stream_close(stream_id: u32, reset: bool) -> BytesMut {
        stream_frame(stream_id, StreamFrameType::Close, &protocol::encode_close(reset))
    }

    fn stream_frame(stream_id: u32, kind: StreamFrameType, body: &[u8]) -> BytesMut {
        let fixed = FixedHeader {
            data_frame_type: DATA_FRAME_STREAM,
            stream_frame_type: kind,
            total_size: (FIXED_HEADER_SIZE + body.len()) as u32,
            pb_header_size: 0,
            stream_id,
        };
        let mut out = BytesMut::new();
        fixed.write(&mut out);
        out.put_slice(body);
        out
    }
}
