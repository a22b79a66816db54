use std::fmt;
use std::io;

use thiserror::Error;

/// Failure raised while decoding or encoding a wire message.
///
/// Decode failures are fatal to the connection that produced the bytes: once a
/// header fails validation the buffer can no longer be trusted to contain a
/// frame boundary, so callers close the connection instead of attempting a
/// reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame did not start with the protocol's magic value.
    #[error("{protocol}: invalid magic 0x{found:x}, expected 0x{expected:x}")]
    InvalidMagic {
        /// Name of the protocol whose header was rejected.
        protocol: &'static str,
        /// Magic value mandated by the protocol.
        expected: u32,
        /// Value found on the wire.
        found: u32,
    },

    /// A length field declared a frame that cannot be valid.
    #[error("{protocol}: invalid frame length {length}: {reason}")]
    InvalidLength {
        /// Name of the protocol whose header was rejected.
        protocol: &'static str,
        /// Offending length value.
        length: u64,
        /// Why the length was rejected.
        reason: &'static str,
    },

    /// The frame header or body could not be parsed.
    #[error("{protocol}: malformed message: {detail}")]
    Malformed {
        /// Name of the protocol whose message was rejected.
        protocol: &'static str,
        /// Human readable description of the problem.
        detail: String,
    },

    /// A protobuf-encoded section was truncated or used an unknown wire type.
    #[error("protobuf: {0}")]
    Protobuf(&'static str),

    /// The codec was asked to encode a message type it does not support.
    #[error("{protocol}: cannot encode {message_type} message")]
    Unsupported {
        /// Name of the protocol.
        protocol: &'static str,
        /// Message type that was requested.
        message_type: crate::MessageType,
    },

    /// An I/O error surfaced through a framed stream adapter.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Builds a [`ProtocolError::Malformed`] value.
    pub fn malformed(protocol: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            detail: detail.into(),
        }
    }
}

impl From<ProtocolError> for io::Error {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Io(inner) => inner,
            other => Self::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Category of a message-level failure that is answered with a protocol
/// native error reply.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorType {
    /// No route matched the request.
    RouteNotFound,
    /// The matched route points at a cluster that does not exist.
    ClusterNotFound,
    /// The cluster has no host able to take the request.
    NoHealthyUpstream,
    /// The upstream answered with something that could not be relayed.
    BadResponse,
    /// Any other failure.
    Unspecified,
    /// The request was rejected by a rate limiter.
    OverLimit,
}

impl ErrorType {
    /// Every error category, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::RouteNotFound,
        Self::ClusterNotFound,
        Self::NoHealthyUpstream,
        Self::BadResponse,
        Self::Unspecified,
        Self::OverLimit,
    ];

    /// Returns the stable name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RouteNotFound => "route_not_found",
            Self::ClusterNotFound => "cluster_not_found",
            Self::NoHealthyUpstream => "no_healthy_upstream",
            Self::BadResponse => "bad_response",
            Self::Unspecified => "unspecified",
            Self::OverLimit => "over_limit",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message-level error handed to [`Codec::on_error`](crate::Codec::on_error).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppError {
    kind: ErrorType,
    message: String,
}

impl AppError {
    /// Creates an error of the given category.
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorType {
        self.kind
    }

    /// Returns the human readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}
