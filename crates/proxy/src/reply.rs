//! crates/proxy/src/reply.rs
//!
//! Replies generated by the proxy itself instead of an upstream host.

use bytes::BytesMut;
use codec::{AppError, Codec, ErrorType, MessageType, Metadata, Mutation, ProtocolError};

/// Kind of a locally generated reply, used for stats.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseType {
    /// A successful reply.
    SuccessReply,
    /// A reply carrying an application error.
    ErrorReply,
    /// A reply carrying an exception.
    Exception,
}

/// A reply the connection manager writes on behalf of a request.
pub trait DirectResponse {
    /// Writes the reply to `request` into `buffer` using the connection's codec.
    fn encode(
        &self,
        request: &Metadata,
        codec: &mut dyn Codec,
        buffer: &mut BytesMut,
    ) -> Result<ResponseType, ProtocolError>;
}

/// Protocol-native error reply.
#[derive(Clone, Debug)]
pub struct AppException(pub AppError);

impl AppException {
    /// Creates an error reply of category `kind`.
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self(AppError::new(kind, message))
    }

    /// The carried error.
    #[must_use]
    pub const fn error(&self) -> &AppError {
        &self.0
    }
}

impl DirectResponse for AppException {
    fn encode(
        &self,
        request: &Metadata,
        codec: &mut dyn Codec,
        buffer: &mut BytesMut,
    ) -> Result<ResponseType, ProtocolError> {
        codec.on_error(request, &self.0, buffer)?;
        Ok(ResponseType::ErrorReply)
    }
}

/// Reply to a heartbeat.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeartbeatResponse;

impl DirectResponse for HeartbeatResponse {
    fn encode(
        &self,
        request: &Metadata,
        codec: &mut dyn Codec,
        buffer: &mut BytesMut,
    ) -> Result<ResponseType, ProtocolError> {
        let mutation = Mutation::new();
        if request.message_type() == MessageType::Heartbeat {
            codec.encode(request, &mutation, buffer)?;
        } else {
            let mut heartbeat = request.clone();
            heartbeat.set_message_type(MessageType::Heartbeat);
            codec.encode(&heartbeat, &mutation, buffer)?;
        }
        Ok(ResponseType::SuccessReply)
    }
}
