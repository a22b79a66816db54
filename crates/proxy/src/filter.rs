//! crates/proxy/src/filter.rs
//!
//! Filter contracts. Decoder filters see each request after it is decoded and
//! may pause, abort or answer it; encoder filters see each upstream response
//! before it is written downstream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{Codec, Metadata, Mutation};

use crate::message::FilterHandle;
use crate::reply::DirectResponse;
use crate::route::Route;
use crate::upstream::{
    ConnectionPool, PoolFailureReason, UpstreamConnection, UpstreamEvent, UpstreamHandlerManager,
};

/// Verdict of one filter invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterStatus {
    /// Run the next filter.
    ContinueIteration,
    /// Stop here until the filter asks to continue.
    PauseIteration,
    /// Stop and discard the message.
    AbortIteration,
    /// Stop and let the caller retry.
    Retry,
}

/// Where a resumed iteration starts relative to the filter that paused it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterIterationStartState {
    /// Resume after the paused filter.
    AlwaysStartFromNext,
    /// Call the paused filter again; the message bytes were not consumed yet.
    CanStartFromCurrent,
}

/// Progress of an upstream response fed through
/// [`DecoderFilterCallbacks::upstream_data`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpstreamResponseStatus {
    /// The response is incomplete.
    MoreData,
    /// The response was handled and the request is finished.
    Complete,
    /// The response could not be relayed; the upstream connection must be
    /// closed.
    Reset,
    /// An encoder filter asked for the request to be retried.
    Retry,
}

/// Asynchronous notification for a decoder filter.
#[derive(Debug)]
pub enum FilterEvent {
    /// Pool or connection event for a connection the filter requested.
    Upstream(UpstreamEvent),
    /// The multiplexed upstream connection the filter waits on is ready.
    HandlerReady,
    /// The multiplexed upstream connection could not be established.
    HandlerFailed(PoolFailureReason),
    /// The multiplexed upstream connection closed with the request in flight.
    HandlerClosed,
    /// A multiplexed upstream connection decoded the response to this request.
    Response(Metadata),
}

/// Access a decoder filter has to its message and connection.
pub trait DecoderFilterCallbacks {
    /// Random identifier of the in-flight message.
    fn stream_id(&self) -> u64;

    /// Protocol request id of the message.
    fn request_id(&self) -> u64;

    /// Decoded request.
    fn metadata(&self) -> &Metadata;

    /// Decoded request, mutable.
    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Edits applied when the request is encoded.
    fn mutation(&self) -> &Mutation;

    /// Edits applied when the request is encoded, mutable.
    fn mutation_mut(&mut self) -> &mut Mutation;

    /// Route selected for the message. Computed once and cached.
    fn route(&mut self) -> Option<Route>;

    /// Address of the downstream peer.
    fn downstream_address(&self) -> Option<SocketAddr>;

    /// Creates a codec of the connection's protocol.
    fn create_codec(&self) -> Box<dyn Codec>;

    /// Handle that addresses this filter in upstream events.
    fn target(&self) -> FilterHandle;

    /// Answers the request locally.
    ///
    /// With `end_stream` the downstream connection is closed after the reply.
    /// Otherwise the remaining filters are skipped and the message finishes
    /// once the chain returns.
    fn send_local_reply(&mut self, response: &dyn DirectResponse, end_stream: bool);

    /// Asks the connection manager to resume the chain after this filter
    /// returns from the current event.
    fn continue_decoding(&mut self);

    /// Discards the message at the end of the current dispatch.
    fn reset_stream(&mut self);

    /// Closes the downstream connection without flushing.
    fn reset_downstream_connection(&mut self);

    /// Creates the decoder for the upstream response.
    fn start_upstream_response(&mut self);

    /// Feeds upstream bytes to the response decoder.
    fn upstream_data(&mut self, buffer: &mut BytesMut) -> UpstreamResponseStatus;

    /// Relays a response decoded elsewhere, such as by a multiplexed upstream
    /// handler.
    fn upstream_response(&mut self, response: Metadata) -> UpstreamResponseStatus;

    /// Decoded upstream response, once complete.
    fn response_metadata(&self) -> Option<&Metadata>;

    /// Hands the upstream connection of a stream initiation to the stream it
    /// opened.
    fn set_upstream_connection(&mut self, connection: Box<dyn UpstreamConnection>);

    /// Multiplexed upstream connections of the downstream connection.
    fn upstream_handlers(&mut self) -> &mut UpstreamHandlerManager;

    /// Sends a copy of the request to `pool` and discards the answer.
    fn submit_shadow(&mut self, cluster: &str, pool: Arc<dyn ConnectionPool>);
}

/// Access an encoder filter has while a response passes through it.
pub trait EncoderFilterCallbacks {
    /// Random identifier of the in-flight message.
    fn stream_id(&self) -> u64;

    /// Protocol request id of the request being answered.
    fn request_id(&self) -> u64;

    /// The request being answered.
    fn request_metadata(&self) -> &Metadata;

    /// Handle to pass to
    /// [`ConnectionManager::continue_encoding`](crate::ConnectionManager::continue_encoding)
    /// after pausing.
    fn target(&self) -> FilterHandle;
}

/// Request path filter.
pub trait DecoderFilter: Send {
    /// Called once per request, and again after a resume that starts from this
    /// filter.
    fn on_message_decoded(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) -> FilterStatus;

    /// Upstream notification addressed to this filter.
    fn on_event(&mut self, event: FilterEvent, callbacks: &mut dyn DecoderFilterCallbacks) {
        let _ = (event, callbacks);
    }

    /// The message is being destroyed.
    fn on_destroy(&mut self) {}
}

/// Response path filter.
pub trait EncoderFilter: Send {
    /// Called once per response.
    fn on_message_encoded(
        &mut self,
        metadata: &mut Metadata,
        mutation: &mut Mutation,
        callbacks: &mut dyn EncoderFilterCallbacks,
    ) -> FilterStatus;

    /// The message is being destroyed.
    fn on_destroy(&mut self) {}
}

/// Filters collected for one message, in call order.
#[derive(Default)]
pub struct FilterChainBuilder {
    pub(crate) decoder_filters: Vec<Box<dyn DecoderFilter>>,
    pub(crate) encoder_filters: Vec<Box<dyn EncoderFilter>>,
}

impl FilterChainBuilder {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request path filter.
    pub fn add_decoder_filter(&mut self, filter: Box<dyn DecoderFilter>) {
        self.decoder_filters.push(filter);
    }

    /// Appends a response path filter.
    pub fn add_encoder_filter(&mut self, filter: Box<dyn EncoderFilter>) {
        self.encoder_filters.push(filter);
    }

    /// Number of decoder filters added so far.
    #[must_use]
    pub fn decoder_len(&self) -> usize {
        self.decoder_filters.len()
    }

    /// Number of encoder filters added so far.
    #[must_use]
    pub fn encoder_len(&self) -> usize {
        self.encoder_filters.len()
    }
}

/// Creates the filters one configured filter contributes to each message.
pub trait FilterFactory: Send + Sync {
    /// Configuration name, used in logs.
    fn name(&self) -> &'static str;

    /// Adds fresh filter instances to `chain`.
    fn create_filters(&self, chain: &mut FilterChainBuilder);
}
