//! Callback objects handed to filters, and the response half of a message.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{Codec, ErrorType, MessageType, Metadata, Mutation, ResponseStatus};
use tracing::{debug, error, trace, warn};

use super::{LOG_TARGET, Shared};
use crate::filter::{
    DecoderFilterCallbacks, EncoderFilterCallbacks, FilterStatus, UpstreamResponseStatus,
};
use crate::message::{ActiveMessage, FilterHandle, MessageHandle, ResponseDecoder};
use crate::reply::{AppException, DirectResponse};
use crate::route::Route;
use crate::upstream::{ConnectionPool, UpstreamConnection, UpstreamHandlerManager};

/// Callbacks for the decoder filter at `target`, holding its message and the
/// connection state while the filter runs.
pub(crate) struct MessageCallbacks<'a> {
    shared: &'a mut Shared,
    message: &'a mut ActiveMessage,
    target: FilterHandle,
    resume: bool,
}

impl<'a> MessageCallbacks<'a> {
    pub(crate) fn new(
        shared: &'a mut Shared,
        message: &'a mut ActiveMessage,
        target: FilterHandle,
    ) -> Self {
        Self {
            shared,
            message,
            target,
            resume: false,
        }
    }

    pub(crate) const fn resume_requested(&self) -> bool {
        self.resume
    }

    /// Answers with BadResponse and tears the message down.
    fn bad_response(&mut self, reason: String) {
        error!(target: LOG_TARGET, stream_id = self.message.stream_id, %reason, "bad upstream response");
        let reply = AppException::new(ErrorType::BadResponse, reason);
        self.send_local_reply(&reply, false);
        self.message.response_decoder = None;
        self.message.reset_requested = true;
    }
}

impl DecoderFilterCallbacks for MessageCallbacks<'_> {
    fn stream_id(&self) -> u64 {
        self.message.stream_id
    }

    fn request_id(&self) -> u64 {
        self.message.request_id()
    }

    fn metadata(&self) -> &Metadata {
        &self.message.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.message.metadata
    }

    fn mutation(&self) -> &Mutation {
        &self.message.mutation
    }

    fn mutation_mut(&mut self) -> &mut Mutation {
        &mut self.message.mutation
    }

    fn route(&mut self) -> Option<Route> {
        if let Some(cached) = &self.message.route {
            return cached.clone();
        }
        let route = self
            .shared
            .config
            .routes()
            .route(&self.message.metadata, self.message.stream_id);
        self.message.route = Some(route.clone());
        route
    }

    fn downstream_address(&self) -> Option<SocketAddr> {
        self.shared.downstream.peer_address()
    }

    fn create_codec(&self) -> Box<dyn Codec> {
        self.shared.config.create_codec()
    }

    fn target(&self) -> FilterHandle {
        self.target
    }

    fn send_local_reply(&mut self, response: &dyn DirectResponse, end_stream: bool) {
        self.shared
            .send_local_reply(&self.message.metadata, response, end_stream);
        if !end_stream {
            self.message.local_response_sent = true;
        }
    }

    fn continue_decoding(&mut self) {
        self.resume = true;
    }

    fn reset_stream(&mut self) {
        self.message.reset_requested = true;
    }

    fn reset_downstream_connection(&mut self) {
        self.shared
            .close_downstream(crate::upstream::CloseType::NoFlush);
    }

    fn start_upstream_response(&mut self) {
        if self.message.response_decoder.is_some() {
            warn!(target: LOG_TARGET, stream_id = self.message.stream_id, "upstream response already started");
            return;
        }
        trace!(target: LOG_TARGET, stream_id = self.message.stream_id, "upstream response started");
        self.message.response_decoder = Some(ResponseDecoder::new(self.shared.config.create_codec()));
    }

    fn upstream_data(&mut self, buffer: &mut BytesMut) -> UpstreamResponseStatus {
        let Some(decoder) = self.message.response_decoder.as_mut() else {
            warn!(target: LOG_TARGET, stream_id = self.message.stream_id, "upstream data without a started response");
            return UpstreamResponseStatus::Reset;
        };
        trace!(target: LOG_TARGET, stream_id = self.message.stream_id, bytes = buffer.len(), "upstream data");
        match decoder.decode_one(buffer) {
            Ok(None) => UpstreamResponseStatus::MoreData,
            Ok(Some(response)) => self.upstream_response(response),
            Err(error) => {
                self.shared.stats.response_decoding_error.inc();
                self.bad_response(format!("undecodable upstream response: {error}"));
                UpstreamResponseStatus::Reset
            }
        }
    }

    fn upstream_response(&mut self, response: Metadata) -> UpstreamResponseStatus {
        let expected = self.message.request_id();
        if response.request_id() != expected {
            self.shared.stats.response_decoding_error.inc();
            self.bad_response(format!(
                "response id {} does not match request id {expected}",
                response.request_id()
            ));
            return UpstreamResponseStatus::Reset;
        }
        self.message.response = Some((response, Mutation::new()));
        match apply_encoder_filters(self.message, self.target.message, 0) {
            FilterStatus::ContinueIteration => forward_response(self.shared, self.message),
            FilterStatus::PauseIteration => {
                debug!(target: LOG_TARGET, stream_id = self.message.stream_id, "response held by encoder filter");
                self.message.encoder_paused = true;
                UpstreamResponseStatus::Complete
            }
            FilterStatus::Retry => {
                self.message.response = None;
                self.message.response_decoder = None;
                UpstreamResponseStatus::Retry
            }
            FilterStatus::AbortIteration => {
                self.message.response = None;
                self.message.reset_requested = true;
                UpstreamResponseStatus::Complete
            }
        }
    }

    fn response_metadata(&self) -> Option<&Metadata> {
        self.message.response.as_ref().map(|(response, _)| response)
    }

    fn set_upstream_connection(&mut self, connection: Box<dyn UpstreamConnection>) {
        self.shared.stats.request_stream.inc();
        let codec = self.shared.config.create_codec();
        self.shared
            .streams
            .open(self.message.metadata.stream_id(), connection, codec);
    }

    fn upstream_handlers(&mut self) -> &mut UpstreamHandlerManager {
        &mut self.shared.handlers
    }

    fn submit_shadow(&mut self, cluster: &str, pool: Arc<dyn ConnectionPool>) {
        let mut copy = self.message.metadata.clone();
        let mut request = copy.take_origin_message();
        let mut codec = self.shared.config.create_codec();
        if let Err(error) = codec.encode(&copy, &self.message.mutation, &mut request) {
            warn!(target: LOG_TARGET, cluster, %error, "failed to encode shadow request");
            return;
        }
        let one_way = copy.message_type() == MessageType::Oneway;
        self.shared
            .shadows
            .submit(cluster, pool, request, one_way, self.shared.config.create_codec());
    }
}

/// Callbacks for one encoder filter.
struct EncoderCallbacks<'a> {
    message: &'a ActiveMessage,
    target: FilterHandle,
}

impl EncoderFilterCallbacks for EncoderCallbacks<'_> {
    fn stream_id(&self) -> u64 {
        self.message.stream_id
    }

    fn request_id(&self) -> u64 {
        self.message.request_id()
    }

    fn request_metadata(&self) -> &Metadata {
        &self.message.metadata
    }

    fn target(&self) -> FilterHandle {
        self.target
    }
}

/// Runs the encoder filters from `start` over the message's pending response.
pub(crate) fn apply_encoder_filters(
    message: &mut ActiveMessage,
    handle: MessageHandle,
    start: usize,
) -> FilterStatus {
    let Some((mut metadata, mut mutation)) = message.response.take() else {
        return FilterStatus::ContinueIteration;
    };
    let mut status = FilterStatus::ContinueIteration;
    let mut index = start;
    while index < message.encoder_filters.len() && !message.local_response_sent {
        let Some(mut filter) = message.encoder_filters[index].take() else {
            index += 1;
            continue;
        };
        let result = {
            let mut callbacks = EncoderCallbacks {
                message: &*message,
                target: FilterHandle {
                    message: handle,
                    index,
                },
            };
            filter.on_message_encoded(&mut metadata, &mut mutation, &mut callbacks)
        };
        message.encoder_filters[index] = Some(filter);
        if result != FilterStatus::ContinueIteration {
            trace!(target: LOG_TARGET, stream_id = message.stream_id, index, ?result, "encoder chain stopped");
            status = result;
            break;
        }
        index += 1;
    }
    message.response = Some((metadata, mutation));
    status
}

/// Writes the message's response downstream and marks the message finished.
pub(crate) fn forward_response(
    shared: &mut Shared,
    message: &mut ActiveMessage,
) -> UpstreamResponseStatus {
    let Some((mut response, mutation)) = message.response.take() else {
        return UpstreamResponseStatus::Complete;
    };
    message.reset_requested = true;
    if !shared.downstream_open() {
        error!(target: LOG_TARGET, stream_id = message.stream_id, "downstream connection gone, response dropped");
        shared.stats.response_error_caused_connection_close.inc();
        return UpstreamResponseStatus::Reset;
    }

    let mut bytes = response.take_origin_message();
    if !mutation.is_empty() {
        let mut codec = shared.config.create_codec();
        if let Err(error) = codec.encode(&response, &mutation, &mut bytes) {
            warn!(target: LOG_TARGET, stream_id = message.stream_id, %error, "response rewrite failed, forwarding unchanged");
        }
    }
    debug!(
        target: LOG_TARGET,
        stream_id = message.stream_id,
        request_id = response.request_id(),
        bytes = bytes.len(),
        "response forwarded"
    );
    shared.downstream.write(bytes, false);

    let stats = &shared.stats;
    stats.response.inc();
    stats.response_decoding_success.inc();
    if response.message_type() == MessageType::Error {
        stats.response_business_exception.inc();
    }
    match response.response_status() {
        ResponseStatus::Ok => stats.response_success.inc(),
        ResponseStatus::Error => stats.response_error.inc(),
    }
    message.response = Some((response, mutation));
    UpstreamResponseStatus::Complete
}
