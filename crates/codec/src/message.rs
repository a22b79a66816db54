use std::fmt;

/// Kind of message carried by a frame.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageType {
    /// Two-way request expecting a response.
    #[default]
    Request,
    /// Response to a request.
    Response,
    /// Request that expects no response.
    Oneway,
    /// Keep-alive probe or its reply.
    Heartbeat,
    /// Response carrying an application error.
    Error,
    /// First frame of a duplex stream.
    StreamInit,
    /// Payload frame on an established stream.
    StreamData,
    /// Closes one direction of a stream.
    StreamCloseOneWay,
    /// Closes both directions of a stream.
    StreamCloseTwoWay,
}

impl MessageType {
    /// Returns `true` when no response is expected for the message.
    #[must_use]
    pub const fn is_one_way(self) -> bool {
        matches!(self, Self::Oneway)
    }

    /// Returns `true` for frames that belong to an already established stream.
    ///
    /// These frames bypass the filter chain and are forwarded to the stream
    /// registered for their stream id.
    #[must_use]
    pub const fn is_stream_frame(self) -> bool {
        matches!(
            self,
            Self::StreamData | Self::StreamCloseOneWay | Self::StreamCloseTwoWay
        )
    }

    /// Returns `true` for message types a response decoder may produce.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }

    /// Stable lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Oneway => "oneway",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::StreamInit => "stream_init",
            Self::StreamData => "stream_data",
            Self::StreamCloseOneWay => "stream_close_oneway",
            Self::StreamCloseTwoWay => "stream_close_twoway",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported by a response.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResponseStatus {
    /// The upstream handled the request.
    #[default]
    Ok,
    /// The upstream (or the proxy) reported a failure.
    Error,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Error => "error",
        })
    }
}

/// Result of one [`Codec::decode`](crate::Codec::decode) step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeStatus {
    /// More bytes are required; nothing beyond already-validated state was consumed.
    WaitForData,
    /// One complete message was moved into the metadata.
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frames_are_classified() {
        assert!(MessageType::StreamData.is_stream_frame());
        assert!(MessageType::StreamCloseOneWay.is_stream_frame());
        assert!(MessageType::StreamCloseTwoWay.is_stream_frame());
        assert!(!MessageType::StreamInit.is_stream_frame());
        assert!(!MessageType::Request.is_stream_frame());
    }

    #[test]
    fn only_oneway_is_one_way() {
        assert!(MessageType::Oneway.is_one_way());
        assert!(!MessageType::Request.is_one_way());
        assert!(!MessageType::Heartbeat.is_one_way());
    }

    #[test]
    fn display_uses_stable_names() {
        assert_eq!(MessageType::StreamInit.to_string(), "stream_init");
        assert_eq!(ResponseStatus::Error.to_string(), "error");
    }
}
