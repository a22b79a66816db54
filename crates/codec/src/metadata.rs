//! crates/codec/src/metadata.rs
//!
//! Per-message fact sheet produced by a codec and carried through the filter
//! chain, the router and the response path.

use bytes::BytesMut;
use rustc_hash::FxHashMap;

use crate::message::{MessageType, ResponseStatus};
use crate::value::Value;

/// Header under which the router records the address of the upstream host
/// that received the request.
pub const HEADER_REAL_SERVER_ADDRESS: &str = "x-meta-protocol-real-server-address";

/// Decoded facts about one message plus its original wire bytes.
///
/// Two property maps are kept apart: `headers` holds string pairs that take
/// part in route matching, rate-limit descriptors and hash policies, while
/// `properties` holds typed values that only codecs and filters interpret.
///
/// `Clone` is deep: the origin bytes are copied, so a mirrored request never
/// shares a mutable buffer with the primary one.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    message_type: MessageType,
    response_status: ResponseStatus,
    request_id: u64,
    stream_id: u64,
    header_size: usize,
    body_size: usize,
    origin_message: BytesMut,
    properties: FxHashMap<String, Value>,
    headers: FxHashMap<String, String>,
}

impl Metadata {
    /// Creates empty metadata for a message of the given type.
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Self::default()
        }
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Sets the message type.
    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    /// Returns the response status.
    #[must_use]
    pub const fn response_status(&self) -> ResponseStatus {
        self.response_status
    }

    /// Sets the response status.
    pub fn set_response_status(&mut self, status: ResponseStatus) {
        self.response_status = status;
    }

    /// Returns the request id used for request/response correlation.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Sets the request id.
    pub fn set_request_id(&mut self, request_id: u64) {
        self.request_id = request_id;
    }

    /// Returns the stream id for duplex stream frames.
    #[must_use]
    pub const fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Sets the stream id.
    pub fn set_stream_id(&mut self, stream_id: u64) {
        self.stream_id = stream_id;
    }

    /// Returns the size of the protocol header in bytes.
    #[must_use]
    pub const fn header_size(&self) -> usize {
        self.header_size
    }

    /// Sets the size of the protocol header.
    pub fn set_header_size(&mut self, header_size: usize) {
        self.header_size = header_size;
    }

    /// Returns the size of the message body in bytes.
    #[must_use]
    pub const fn body_size(&self) -> usize {
        self.body_size
    }

    /// Sets the size of the message body.
    pub fn set_body_size(&mut self, body_size: usize) {
        self.body_size = body_size;
    }

    /// Returns `header_size + body_size`.
    #[must_use]
    pub const fn message_size(&self) -> usize {
        self.header_size + self.body_size
    }

    /// Returns the original wire bytes of the message.
    #[must_use]
    pub const fn origin_message(&self) -> &BytesMut {
        &self.origin_message
    }

    /// Returns the original wire bytes mutably.
    pub fn origin_message_mut(&mut self) -> &mut BytesMut {
        &mut self.origin_message
    }

    /// Replaces the original wire bytes.
    pub fn set_origin_message(&mut self, message: BytesMut) {
        self.origin_message = message;
    }

    /// Moves the original wire bytes out, leaving an empty buffer behind.
    pub fn take_origin_message(&mut self) -> BytesMut {
        std::mem::take(&mut self.origin_message)
    }

    /// Stores a typed property. Properties do not take part in routing.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Returns a typed property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Stores a string header used for route matching.
    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Returns a header value, falling back to a string property of the same name.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .map(String::as_str)
            .or_else(|| self.properties.get(key).and_then(Value::as_str))
    }

    /// Returns a boolean property, `false` when absent or of another type.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Returns an integer property as `u32`, `0` when absent or out of range.
    #[must_use]
    pub fn get_u32(&self, key: &str) -> u32 {
        self.get(key).and_then(Value::as_u32).unwrap_or(0)
    }

    /// Returns the route-matching headers.
    #[must_use]
    pub const fn headers(&self) -> &FxHashMap<String, String> {
        &self.headers
    }

    /// Returns the typed properties.
    #[must_use]
    pub const fn properties(&self) -> &FxHashMap<String, Value> {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_size_sums_header_and_body() {
        let mut metadata = Metadata::new(MessageType::Request);
        metadata.set_header_size(12);
        metadata.set_body_size(20);
        assert_eq!(metadata.message_size(), 32);
    }

    #[test]
    fn strings_are_routing_headers() {
        let mut metadata = Metadata::default();
        metadata.put_string("service", "echo");
        metadata.put("call_type", 1u32);
        assert_eq!(metadata.headers().get("service").map(String::as_str), Some("echo"));
        assert!(!metadata.headers().contains_key("call_type"));
        assert_eq!(metadata.get_u32("call_type"), 1);
    }

    #[test]
    fn get_string_falls_back_to_string_property() {
        let mut metadata = Metadata::default();
        metadata.put("version", "1.0.0");
        assert_eq!(metadata.get_string("version"), Some("1.0.0"));
        assert_eq!(metadata.get_string("missing"), None);
    }

    #[test]
    fn typed_getters_default_when_absent() {
        let metadata = Metadata::default();
        assert!(!metadata.get_bool("two_way"));
        assert_eq!(metadata.get_u32("timeout"), 0);
    }

    #[test]
    fn take_origin_message_leaves_empty_buffer() {
        let mut metadata = Metadata::default();
        metadata.set_origin_message(BytesMut::from(&b"frame"[..]));
        let taken = metadata.take_origin_message();
        assert_eq!(&taken[..], b"frame");
        assert!(metadata.origin_message().is_empty());
    }

    #[test]
    fn clone_copies_origin_bytes() {
        let mut primary = Metadata::new(MessageType::Request);
        primary.set_request_id(9);
        primary.put_string("method", "get");
        primary.set_origin_message(BytesMut::from(&b"abc"[..]));

        let mut shadow = primary.clone();
        shadow.origin_message_mut()[0] = b'x';

        assert_eq!(&primary.origin_message()[..], b"abc");
        assert_eq!(&shadow.origin_message()[..], b"xbc");
        assert_eq!(shadow.request_id(), 9);
        assert_eq!(shadow.get_string("method"), Some("get"));
    }
}
