//! crates/codec/src/dubbo/mod.rs
//!
//! Dubbo framing with Hessian2 bodies.
//!
//! ```text
//! 0       2      3        4                12            16
//! +-------+------+--------+----------------+-------------+
//! |0xdabb | flag | status | request id BE64 | body len BE32|
//! +-------+------+--------+----------------+-------------+
//! ```
//!
//! `flag` holds the request (`0x80`), two-way (`0x40`) and event (`0x20`)
//! bits plus the serialization id in its low five bits. Heartbeats are
//! events whose body is a Hessian null.

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::buffer::BufferExt;
use crate::codec::Codec;
use crate::error::{AppError, ErrorType, ProtocolError};
use crate::hessian;
use crate::message::{DecodeStatus, MessageType, ResponseStatus};
use crate::metadata::Metadata;
use crate::mutation::Mutation;

const PROTOCOL: &str = "dubbo";

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 16;

/// Frame magic.
pub const MAGIC: u16 = 0xdabb;

/// Largest accepted body, matching Dubbo's default payload limit.
pub const MAX_BODY_SIZE: u32 = 8 * 1024 * 1024;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWO_WAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1f;

/// Serialization id of Hessian2.
pub const SERIALIZATION_HESSIAN2: u8 = 2;

/// Body of a heartbeat: a Hessian null.
const HEARTBEAT_BODY: u8 = b'N';

// Leading byte of a Hessian2 compact int holding the response body type.
const RESPONSE_WITH_EXCEPTION: u8 = 0x90;
const RESPONSE_WITH_EXCEPTION_ATTACHMENTS: u8 = 0x93;

/// Response status byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    /// The call succeeded.
    Ok = 20,
    /// The upstream answered with something that could not be relayed.
    BadResponse = 50,
    /// No provider exposes the requested service.
    ServiceNotFound = 60,
    /// The server failed to process the call.
    ServerError = 80,
    /// The server rejected the call because it is saturated.
    ServerThreadpoolExhausted = 100,
}

/// Status written into locally generated error responses.
#[must_use]
pub const fn error_status(kind: ErrorType) -> Status {
    match kind {
        ErrorType::RouteNotFound | ErrorType::ClusterNotFound => Status::ServiceNotFound,
        ErrorType::BadResponse => Status::BadResponse,
        ErrorType::OverLimit => Status::ServerThreadpoolExhausted,
        ErrorType::NoHealthyUpstream | ErrorType::Unspecified => Status::ServerError,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Header {
    flag: u8,
    status: u8,
    request_id: u64,
    body_len: u32,
}

impl Header {
    fn peek(buffer: &BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let magic = buffer.peek_be_u16(0).unwrap_or_default();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic {
                protocol: PROTOCOL,
                expected: u32::from(MAGIC),
                found: u32::from(magic),
            });
        }
        let header = Self {
            flag: buffer.peek_u8(2).unwrap_or_default(),
            status: buffer.peek_u8(3).unwrap_or_default(),
            request_id: buffer.peek_be_u64(4).unwrap_or_default(),
            body_len: buffer.peek_be_u32(12).unwrap_or_default(),
        };
        if header.body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: u64::from(header.body_len),
                reason: "body exceeds maximum payload size",
            });
        }
        Ok(Some(header))
    }

    const fn is_request(&self) -> bool {
        self.flag & FLAG_REQUEST != 0
    }

    const fn is_two_way(&self) -> bool {
        self.flag & FLAG_TWO_WAY != 0
    }

    const fn is_event(&self) -> bool {
        self.flag & FLAG_EVENT != 0
    }

    const fn serialization(&self) -> u8 {
        self.flag & SERIALIZATION_MASK
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.flag);
        buf.put_u8(self.status);
        buf.put_u64(self.request_id);
        buf.put_u32(self.body_len);
    }
}

/// Routing fields at the start of a Hessian2 request body.
#[derive(Debug, Default)]
struct Invocation {
    dubbo_version: Option<String>,
    interface: Option<String>,
    version: Option<String>,
    method: Option<String>,
}

fn parse_invocation(body: &[u8]) -> Result<Invocation, ProtocolError> {
    let mut offset = 0;
    let mut next = || -> Result<Option<String>, ProtocolError> {
        let (value, used) = hessian::read_string(&body[offset..])?;
        offset += used;
        Ok(value)
    };
    Ok(Invocation {
        dubbo_version: next()?,
        interface: next()?,
        version: next()?,
        method: next()?,
    })
}

/// Dubbo codec.
#[derive(Debug, Default)]
pub struct DubboCodec {
    pending: Option<Header>,
}

impl DubboCodec {
    /// Creates a codec waiting for a frame header.
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    fn to_metadata(header: &Header, body: &[u8], metadata: &mut Metadata) -> Result<(), ProtocolError> {
        metadata.set_request_id(header.request_id);
        metadata.put("serialization_id", u32::from(header.serialization()));
        metadata.put("two_way", header.is_two_way());

        if header.is_event() {
            metadata.set_message_type(MessageType::Heartbeat);
            return Ok(());
        }
        if header.is_request() {
            metadata.set_message_type(if header.is_two_way() {
                MessageType::Request
            } else {
                MessageType::Oneway
            });
            if header.serialization() == SERIALIZATION_HESSIAN2 {
                let invocation = parse_invocation(body)?;
                if let Some(interface) = invocation.interface {
                    metadata.put_string("interface", interface);
                }
                if let Some(method) = invocation.method {
                    metadata.put_string("method", method);
                }
                if let Some(version) = invocation.version {
                    metadata.put_string("version", version);
                }
                if let Some(dubbo_version) = invocation.dubbo_version {
                    metadata.put("dubbo_version", dubbo_version);
                }
            }
            return Ok(());
        }

        metadata.put("dubbo_status", u32::from(header.status));
        if header.status == Status::Ok as u8 {
            let exception = matches!(
                body.first(),
                Some(&(RESPONSE_WITH_EXCEPTION | RESPONSE_WITH_EXCEPTION_ATTACHMENTS))
            );
            metadata.set_message_type(if exception {
                MessageType::Error
            } else {
                MessageType::Response
            });
        } else {
            metadata.set_message_type(MessageType::Response);
            metadata.set_response_status(ResponseStatus::Error);
        }
        Ok(())
    }

    fn serialization_of(metadata: &Metadata) -> u8 {
        match metadata.get_u32("serialization_id") {
            0 => SERIALIZATION_HESSIAN2,
            id => (id as u8) & SERIALIZATION_MASK,
        }
    }
}

impl Codec for DubboCodec {
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
        let header = match self.pending {
            Some(header) => header,
            None => match Header::peek(buffer)? {
                Some(header) => {
                    self.pending = Some(header);
                    header
                }
                None => return Ok(DecodeStatus::WaitForData),
            },
        };
        let frame_len = HEADER_SIZE + header.body_len as usize;
        if buffer.len() < frame_len {
            trace!(target: "meta_proxy::codec", protocol = PROTOCOL, frame_len, "waiting for body");
            return Ok(DecodeStatus::WaitForData);
        }
        self.pending = None;

        Self::to_metadata(&header, &buffer[HEADER_SIZE..frame_len], metadata)?;
        metadata.set_header_size(HEADER_SIZE);
        metadata.set_body_size(header.body_len as usize);
        metadata.set_origin_message(buffer.split_to(frame_len));
        Ok(DecodeStatus::Done)
    }

    fn encode(
        &mut self,
        metadata: &Metadata,
        mutation: &Mutation,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if !buffer.is_empty() {
            if !mutation.is_empty() {
                debug!(
                    target: "meta_proxy::codec",
                    protocol = PROTOCOL,
                    edits = mutation.len(),
                    "attachments are not rewritten; forwarding original bytes"
                );
            }
            return Ok(());
        }
        if metadata.message_type() != MessageType::Heartbeat {
            return Err(ProtocolError::Unsupported {
                protocol: PROTOCOL,
                message_type: metadata.message_type(),
            });
        }
        let header = Header {
            flag: FLAG_EVENT | Self::serialization_of(metadata),
            status: Status::Ok as u8,
            request_id: metadata.request_id(),
            body_len: 1,
        };
        buffer.reserve(HEADER_SIZE + 1);
        header.write(buffer);
        buffer.put_u8(HEARTBEAT_BODY);
        Ok(())
    }

    fn on_error(
        &mut self,
        metadata: &Metadata,
        error: &AppError,
        buffer: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let mut body = Vec::with_capacity(error.message().len() + 3);
        hessian::write_string(&mut body, error.message());
        let header = Header {
            flag: Self::serialization_of(metadata),
            status: error_status(error.kind()) as u8,
            request_id: metadata.request_id(),
            body_len: u32::try_from(body.len()).map_err(|_| ProtocolError::InvalidLength {
                protocol: PROTOCOL,
                length: body.len() as u64,
                reason: "error body exceeds u32",
            })?,
        };
        buffer.reserve(HEADER_SIZE + body.len());
        header.write(buffer);
        buffer.put_slice(&body);
        Ok(())
    }
}

/// Frame builders shared by unit and integration tests.
#[doc(hidden)]
pub mod frames {
    use super::*;

    /// Builds a two-way Hessian2 request frame.
    #[must_use]
    pub fn request(request_id: u64, interface: &str, method: &str) -> BytesMut {
        invocation(request_id, interface, method, true)
    }

    /// Builds a one-way Hessian2 request frame.
    #[must_use]
    pub fn oneway(request_id: u64, interface: &str, method: &str) -> BytesMut {
        invocation(request_id, interface, method, false)
    }

    fn invocation(request_id: u64, interface: &str, method: &str, two_way: bool) -> BytesMut {
        let mut body = Vec::new();
        hessian::write_string(&mut body, "2.0.2");
        hessian::write_string(&mut body, interface);
        hessian::write_string(&mut body, "1.0.0");
        hessian::write_string(&mut body, method);
        hessian::write_string(&mut body, "");
        let mut flag = FLAG_REQUEST | SERIALIZATION_HESSIAN2;
        if two_way {
            flag |= FLAG_TWO_WAY;
        }
        frame(flag, 0, request_id, &body)
    }

    /// Builds a successful response frame.
    #[must_use]
    pub fn response(request_id: u64, body: &[u8]) -> BytesMut {
        frame(SERIALIZATION_HESSIAN2, Status::Ok as u8, request_id, body)
    }

    /// Builds a heartbeat request frame.
    #[must_use]
    pub fn heartbeat(request_id: u64) -> BytesMut {
        frame(
            FLAG_REQUEST | FLAG_TWO_WAY | FLAG_EVENT | SERIALIZATION_HESSIAN2,
            0,
            request_id,
            &[HEARTBEAT_BODY],
        )
    }

    fn frame(flag: u8, status: u8, request_id: u64, body: &[u8]) -> BytesMut {
        let header = Header {
            flag,
            status,
            request_id,
            body_len: body.len() as u32,
        };
        let mut out = BytesMut::with_capacity(HEADER_SIZE + body.len());
        header.write(&mut out);
        out.put_slice(body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::frames::*;
    use super::*;

    fn decode(mut buffer: BytesMut, seed: MessageType) -> Metadata {
        let mut metadata = Metadata::new(seed);
        let status = DubboCodec::new().decode(&mut buffer, &mut metadata).unwrap();
        assert_eq!(status, DecodeStatus::Done);
        assert!(buffer.is_empty());
        metadata
    }

    #[test]
    fn request_exposes_interface_method_and_version() {
        let metadata = decode(request(33, "com.example.Greeter", "sayHello"), MessageType::Request);
        assert_eq!(metadata.message_type(), MessageType::Request);
        assert_eq!(metadata.request_id(), 33);
        assert_eq!(metadata.get_string("interface"), Some("com.example.Greeter"));
        assert_eq!(metadata.get_string("method"), Some("sayHello"));
        assert_eq!(metadata.get_string("version"), Some("1.0.0"));
        assert!(metadata.get_bool("two_way"));
    }

    #[test]
    fn oneway_flag_is_honoured() {
        let metadata = decode(oneway(1, "svc", "fire"), MessageType::Request);
        assert_eq!(metadata.message_type(), MessageType::Oneway);
    }

    #[test]
    fn heartbeat_is_an_event() {
        let metadata = decode(heartbeat(5), MessageType::Request);
        assert_eq!(metadata.message_type(), MessageType::Heartbeat);
        assert_eq!(metadata.request_id(), 5);
    }

    #[test]
    fn heartbeat_reply_echoes_request_id() {
        let request = decode(heartbeat(12), MessageType::Request);
        let mut buffer = BytesMut::new();
        DubboCodec::new()
            .encode(&request, &Mutation::new(), &mut buffer)
            .unwrap();
        assert_eq!(buffer.len(), HEADER_SIZE + 1);
        assert_eq!(buffer[2] & FLAG_REQUEST, 0);
        assert_ne!(buffer[2] & FLAG_EVENT, 0);
        assert_eq!(buffer[3], Status::Ok as u8);

        let reply = decode(buffer, MessageType::Response);
        assert_eq!(reply.message_type(), MessageType::Heartbeat);
        assert_eq!(reply.request_id(), 12);
    }

    #[test]
    fn exception_body_is_an_error_message() {
        let metadata = decode(response(3, &[RESPONSE_WITH_EXCEPTION, 0x01, b'x']), MessageType::Response);
        assert_eq!(metadata.message_type(), MessageType::Error);
        assert_eq!(metadata.response_status(), ResponseStatus::Ok);
    }

    #[test]
    fn partial_body_waits_and_keeps_bytes() {
        let frame = request(2, "svc", "m");
        let mut buffer = BytesMut::from(&frame[..frame.len() - 1]);
        let mut codec = DubboCodec::new();
        let mut metadata = Metadata::new(MessageType::Request);
        assert_eq!(
            codec.decode(&mut buffer, &mut metadata).unwrap(),
            DecodeStatus::WaitForData
        );
        assert_eq!(buffer.len(), frame.len() - 1);
        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(
            codec.decode(&mut buffer, &mut metadata).unwrap(),
            DecodeStatus::Done
        );
        assert_eq!(metadata.origin_message().len(), frame.len());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut frame = request(2, "svc", "m");
        frame[12..16].copy_from_slice(&(MAX_BODY_SIZE + 1).to_be_bytes());
        let mut metadata = Metadata::new(MessageType::Request);
        assert!(matches!(
            DubboCodec::new().decode(&mut frame, &mut metadata),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn every_error_type_has_its_own_arm() {
        assert_eq!(error_status(ErrorType::RouteNotFound), Status::ServiceNotFound);
        assert_eq!(error_status(ErrorType::ClusterNotFound), Status::ServiceNotFound);
        assert_eq!(error_status(ErrorType::BadResponse), Status::BadResponse);
        assert_eq!(error_status(ErrorType::OverLimit), Status::ServerThreadpoolExhausted);
        assert_eq!(error_status(ErrorType::NoHealthyUpstream), Status::ServerError);
        assert_eq!(error_status(ErrorType::Unspecified), Status::ServerError);
    }

    #[test]
    fn on_error_body_is_hessian_message() {
        let request = decode(request(40, "svc", "m"), MessageType::Request);
        let mut buffer = BytesMut::new();
        DubboCodec::new()
            .on_error(
                &request,
                &AppError::new(ErrorType::BadResponse, "request id mismatch"),
                &mut buffer,
            )
            .unwrap();
        assert_eq!(buffer[3], Status::BadResponse as u8);
        let (text, _) = hessian::read_string(&buffer[HEADER_SIZE..]).unwrap();
        assert_eq!(text.as_deref(), Some("request id mismatch"));

        let response = decode(buffer, MessageType::Response);
        assert_eq!(response.request_id(), 40);
        assert_eq!(response.response_status(), ResponseStatus::Error);
    }
}
