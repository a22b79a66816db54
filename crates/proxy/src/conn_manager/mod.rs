//! crates/proxy/src/conn_manager/mod.rs
//!
//! Per-downstream-connection engine. The [`ConnectionManager`] owns the
//! receive buffer, the request decoder, the in-flight messages and every
//! upstream resource opened on their behalf.
//!
//! The manager is driven from outside: the runtime feeds downstream bytes with
//! [`ConnectionManager::on_data`], connection events with
//! [`ConnectionManager::on_event`] and upstream completions with
//! [`ConnectionManager::on_upstream_event`]. Every entry point ends with a
//! tick that frees the messages deleted while it ran.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use codec::{Codec, MessageType, Metadata, Mutation};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, error, trace, warn};

use crate::config::ProxyConfig;
use crate::decoder::{Decoder, DecoderDelegate};
use crate::filter::{FilterChainBuilder, FilterEvent};
use crate::message::{ActiveMessage, FilterHandle, MessageHandle, Slab};
use crate::reply::{DirectResponse, HeartbeatResponse, ResponseType};
use crate::router::ShadowRequests;
use crate::stats::ProxyStats;
use crate::stream::StreamMap;
use crate::upstream::{
    CloseType, ConnectionEvent, DownstreamConnection, HandlerDelivery, UpstreamEvent,
    UpstreamHandler, UpstreamHandlerManager, UpstreamTarget,
};

mod callbacks;
mod chain;

const LOG_TARGET: &str = "meta_proxy::conn_manager";

/// State reachable from filter callbacks. Split from the message slab so a
/// running filter can hold its own message and the connection at once.
pub(crate) struct Shared {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) codec: Box<dyn Codec>,
    pub(crate) downstream: Box<dyn DownstreamConnection>,
    pub(crate) stats: Arc<ProxyStats>,
    pub(crate) handlers: UpstreamHandlerManager,
    pub(crate) streams: StreamMap,
    pub(crate) shadows: ShadowRequests,
    pub(crate) rng: SmallRng,
    pub(crate) closed: bool,
    pub(crate) idle_deadline: Option<Instant>,
}

impl Shared {
    fn touch_idle(&mut self) {
        self.idle_deadline = self.config.idle_timeout().map(|timeout| Instant::now() + timeout);
    }

    pub(crate) fn downstream_open(&self) -> bool {
        !self.closed && self.downstream.is_open()
    }

    pub(crate) fn close_downstream(&mut self, close_type: CloseType) {
        if self.closed {
            return;
        }
        debug!(target: LOG_TARGET, ?close_type, "closing downstream connection");
        self.closed = true;
        self.downstream.close(close_type);
    }

    /// Encodes `response` as the answer to `request` and writes it downstream.
    pub(crate) fn send_local_reply(
        &mut self,
        request: &Metadata,
        response: &dyn DirectResponse,
        end_stream: bool,
    ) {
        if !self.downstream_open() {
            warn!(target: LOG_TARGET, request_id = request.request_id(), "downstream closed, local reply dropped");
            return;
        }
        let mut buffer = BytesMut::new();
        let response_type = match response.encode(request, self.codec.as_mut(), &mut buffer) {
            Ok(response_type) => response_type,
            Err(error) => {
                error!(target: LOG_TARGET, request_id = request.request_id(), %error, "failed to encode local reply");
                return;
            }
        };
        debug!(
            target: LOG_TARGET,
            request_id = request.request_id(),
            ?response_type,
            bytes = buffer.len(),
            end_stream,
            "local reply"
        );
        self.downstream.write(buffer, end_stream);
        if end_stream {
            self.close_downstream(CloseType::FlushWrite);
        }
        match response_type {
            ResponseType::SuccessReply => self.stats.local_response_success.inc(),
            ResponseType::ErrorReply => self.stats.local_response_error.inc(),
            ResponseType::Exception => self.stats.local_response_business_exception.inc(),
        }
    }

    fn on_stream_event(&mut self, id: u64, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Data { mut data, .. } => {
                self.streams
                    .on_upstream_data(id, &mut data, self.downstream.as_mut(), &self.stats);
            }
            UpstreamEvent::Connection(event) if event.is_close() => {
                self.streams.on_upstream_close(id);
            }
            other => trace!(target: LOG_TARGET, stream_id = id, event = ?other, "ignored stream event"),
        }
    }
}

/// Messages plus the state the decoder delegate needs.
pub(crate) struct Core {
    pub(crate) shared: Shared,
    pub(crate) messages: Slab<ActiveMessage>,
    /// Decoding is paused behind a filter.
    stopped: bool,
    /// The message decoding is paused behind.
    paused: Option<MessageHandle>,
    /// The peer half-closed while decoding was paused behind a one-way request.
    half_closed: bool,
}

impl Core {
    fn paused_message_type(&self) -> Option<MessageType> {
        self.paused
            .and_then(|handle| self.messages.get(handle))
            .map(|message| message.metadata.message_type())
    }

    /// Decoding waits on a message that no longer exists.
    fn blocked_on_deleted_message(&self) -> bool {
        self.stopped && self.paused.is_none_or(|handle| !self.messages.contains(handle))
    }

    fn has_live_messages(&self) -> bool {
        !self.messages.handles().is_empty()
    }

    /// Marks every in-flight message deleted and drops connection-scoped
    /// upstream state.
    fn reset_all(&mut self, local: bool) {
        for handle in self.messages.handles() {
            if local {
                self.shared.stats.cx_destroy_local_with_active_rq.inc();
            } else {
                self.shared.stats.cx_destroy_remote_with_active_rq.inc();
            }
            debug!(target: LOG_TARGET, local, "resetting in-flight message");
            self.messages.mark_deleted(handle);
        }
        self.shared.streams.close_all();
        self.shared.handlers.clear();
        self.shared.shadows.clear();
    }

    /// Routes an event for a multiplexed handler and returns the filter
    /// notifications it produced.
    fn on_handler_event(&mut self, key: &str, event: UpstreamEvent) -> Vec<HandlerDelivery> {
        let handlers = &mut self.shared.handlers;
        match event {
            UpstreamEvent::PoolReady(connection) => match handlers.get(key) {
                Some(handler) => handler.on_pool_ready(connection),
                None => Vec::new(),
            },
            UpstreamEvent::PoolFailure(reason) => handlers
                .del(key)
                .map(|mut handler| handler.on_pool_failure(reason))
                .unwrap_or_default(),
            UpstreamEvent::Data { mut data, .. } => {
                let Some(handler) = handlers.get(key) else {
                    return Vec::new();
                };
                match handler.on_upstream_data(&mut data) {
                    Ok(deliveries) => deliveries,
                    Err(error) => {
                        warn!(target: LOG_TARGET, key, %error, "undecodable multiplexed response, closing upstream");
                        self.shared.stats.response_decoding_error.inc();
                        handlers
                            .del(key)
                            .map(|mut handler| {
                                handler.close();
                                handler.on_close()
                            })
                            .unwrap_or_default()
                    }
                }
            }
            UpstreamEvent::Connection(event) if event.is_close() => handlers
                .del(key)
                .map(UpstreamHandler::on_close)
                .unwrap_or_default(),
            UpstreamEvent::Connection(_) => Vec::new(),
        }
    }
}

impl DecoderDelegate for Core {
    type Stream = MessageHandle;

    fn codec(&mut self) -> &mut dyn Codec {
        self.shared.codec.as_mut()
    }

    fn on_heartbeat(&mut self, metadata: Metadata) {
        self.shared.stats.request_event.inc();
        if !self.shared.downstream_open() {
            warn!(target: LOG_TARGET, "downstream closed, heartbeat not answered");
            return;
        }
        let mut buffer = BytesMut::new();
        match HeartbeatResponse.encode(&metadata, self.shared.codec.as_mut(), &mut buffer) {
            Ok(_) => {
                debug!(target: LOG_TARGET, request_id = metadata.request_id(), "heartbeat answered");
                self.shared.downstream.write(buffer, false);
            }
            Err(error) => {
                warn!(target: LOG_TARGET, %error, "failed to encode heartbeat reply");
            }
        }
    }

    fn new_stream(&mut self, metadata: Metadata, mutation: Mutation) -> MessageHandle {
        let mut chain = FilterChainBuilder::new();
        if !metadata.message_type().is_stream_frame() {
            for factory in self.shared.config.filters() {
                factory.create_filters(&mut chain);
            }
        }
        let stream_id = rand::RngCore::next_u64(&mut self.shared.rng);
        self.shared.stats.request_active.inc();
        trace!(
            target: LOG_TARGET,
            stream_id,
            request_id = metadata.request_id(),
            message_type = metadata.message_type().as_str(),
            "new message"
        );
        self.messages
            .insert(ActiveMessage::new(stream_id, metadata, mutation, chain))
    }

    fn on_stream_decoded(&mut self, handle: MessageHandle) {
        self.on_message_decoded(handle);
    }
}

/// Proxies one downstream connection.
pub struct ConnectionManager {
    decoder: Decoder,
    buffer: BytesMut,
    core: Core,
}

impl ConnectionManager {
    /// Creates the manager for a freshly accepted connection.
    pub fn new(config: Arc<ProxyConfig>, downstream: Box<dyn DownstreamConnection>) -> Self {
        let stats = Arc::clone(config.stats());
        let codec = config.create_codec();
        let mut shared = Shared {
            config,
            codec,
            downstream,
            stats,
            handlers: UpstreamHandlerManager::new(),
            streams: StreamMap::default(),
            shadows: ShadowRequests::default(),
            rng: SmallRng::from_entropy(),
            closed: false,
            idle_deadline: None,
        };
        shared.touch_idle();
        Self {
            decoder: Decoder::new(MessageType::Request),
            buffer: BytesMut::new(),
            core: Core {
                shared,
                messages: Slab::default(),
                stopped: false,
                paused: None,
                half_closed: false,
            },
        }
    }

    /// Same as [`ConnectionManager::new`] with a fixed seed for stream ids.
    pub fn with_seed(
        config: Arc<ProxyConfig>,
        downstream: Box<dyn DownstreamConnection>,
        seed: u64,
    ) -> Self {
        let mut manager = Self::new(config, downstream);
        manager.core.shared.rng = SmallRng::seed_from_u64(seed);
        manager
    }

    /// Shared stats of the listener this connection belongs to.
    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.core.shared.stats
    }

    /// Messages not yet finished.
    pub fn active_messages(&self) -> usize {
        self.core.messages.handles().len()
    }

    /// Open streams.
    pub fn active_streams(&self) -> usize {
        self.core.shared.streams.len()
    }

    /// Mirrored requests still waiting on their upstream.
    pub fn active_shadows(&self) -> usize {
        self.core.shared.shadows.len()
    }

    /// Multiplexed upstream handlers.
    pub fn upstream_handlers(&self) -> usize {
        self.core.shared.handlers.len()
    }

    /// Decoding is paused behind a filter.
    pub fn is_stopped(&self) -> bool {
        self.core.stopped
    }

    /// The downstream connection was closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.core.shared.closed
    }

    /// When the idle timer fires, if armed.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.core.shared.closed {
            return None;
        }
        self.core.shared.idle_deadline
    }

    /// Bytes read from the downstream connection.
    pub fn on_data(&mut self, data: BytesMut, end_stream: bool) {
        if self.core.shared.closed {
            trace!(target: LOG_TARGET, bytes = data.len(), "connection closed, ignoring data");
            return;
        }
        trace!(target: LOG_TARGET, bytes = data.len(), end_stream, "downstream data");
        if !data.is_empty() {
            self.core.shared.touch_idle();
            self.buffer.unsplit(data);
        }
        self.dispatch();

        if end_stream && !self.core.shared.closed {
            if self.core.stopped && self.core.paused_message_type() == Some(MessageType::Oneway) {
                debug!(target: LOG_TARGET, "half-closed behind a one-way request, waiting");
                self.core.half_closed = true;
            } else {
                debug!(target: LOG_TARGET, "downstream half-closed");
                self.core.reset_all(false);
                self.core.shared.close_downstream(CloseType::FlushWrite);
            }
        }
        self.end_tick();
    }

    /// Downstream connection event.
    pub fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => return,
            ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose => {
                debug!(target: LOG_TARGET, ?event, "downstream connection closed");
                self.core.shared.closed = true;
                self.core.reset_all(event == ConnectionEvent::LocalClose);
            }
        }
        self.end_tick();
    }

    /// The idle timer fired. Resets every message and closes the connection,
    /// once.
    pub fn on_idle_timeout(&mut self) {
        if self.core.shared.closed {
            return;
        }
        debug!(target: LOG_TARGET, "idle timeout");
        self.core.shared.stats.idle_timeout.inc();
        self.core.reset_all(true);
        self.core.shared.close_downstream(CloseType::NoFlush);
        self.end_tick();
    }

    /// Resumes decoding of buffered bytes.
    pub fn continue_decoding(&mut self) {
        self.resume_decoding();
        self.end_tick();
    }

    /// Resumes the encoder chain of a response paused by the filter at
    /// `target`.
    pub fn continue_encoding(&mut self, target: FilterHandle) {
        self.core.continue_encoding(target);
        self.end_tick();
    }

    /// Completion of an upstream operation, addressed to whoever requested it.
    pub fn on_upstream_event(&mut self, target: UpstreamTarget, event: UpstreamEvent) {
        match target {
            UpstreamTarget::Filter(handle) => {
                self.deliver(handle, FilterEvent::Upstream(event));
            }
            UpstreamTarget::Handler(key) => {
                for delivery in self.core.on_handler_event(&key, event) {
                    self.deliver(delivery.target, delivery.event);
                }
            }
            UpstreamTarget::Stream(id) => self.core.shared.on_stream_event(id, event),
            UpstreamTarget::Shadow(id) => self.core.shared.shadows.on_event(id, event),
        }
        self.end_tick();
    }

    fn deliver(&mut self, target: FilterHandle, event: FilterEvent) {
        let resume = self.core.deliver_event(target, event);
        if resume && self.core.continue_message(target) {
            self.resume_if_blocked_by(target.message);
        }
    }

    fn resume_if_blocked_by(&mut self, message: MessageHandle) {
        if self.core.stopped && self.core.paused.is_none_or(|paused| paused == message) {
            self.resume_decoding();
        }
    }

    fn resume_decoding(&mut self) {
        self.core.stopped = false;
        self.core.paused = None;
        self.dispatch();
        if !self.core.stopped && self.core.half_closed && !self.core.shared.closed {
            debug!(target: LOG_TARGET, "pending half-close");
            self.core.reset_all(false);
            self.core.shared.close_downstream(CloseType::FlushWrite);
        }
    }

    fn dispatch(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.core.stopped {
            debug!(target: LOG_TARGET, buffered = self.buffer.len(), "decoding paused by a filter");
            return;
        }
        while !self.core.stopped && !self.core.shared.closed {
            match self.decoder.on_data(&mut self.buffer, &mut self.core) {
                Ok(true) => break,
                Ok(false) => {}
                Err(error) => {
                    error!(target: LOG_TARGET, %error, "request decoding error");
                    self.core.shared.close_downstream(CloseType::NoFlush);
                    self.core.shared.stats.request_decoding_error.inc();
                    self.core.reset_all(true);
                    self.buffer.clear();
                    break;
                }
            }
        }
    }

    /// Frees the messages deleted during the current entry point.
    fn end_tick(&mut self) {
        if self.core.blocked_on_deleted_message() && !self.core.shared.closed {
            debug!(target: LOG_TARGET, "paused message is gone, resuming");
            self.resume_decoding();
        }
        if self.core.shared.closed && self.core.has_live_messages() {
            self.core.reset_all(true);
        }
        let stats = Arc::clone(&self.core.shared.stats);
        for mut message in self.core.messages.drain_deleted() {
            message.destroy_filters();
            stats.request_active.dec();
            stats.record_request_time(message.started_at.elapsed());
            trace!(target: LOG_TARGET, stream_id = message.stream_id, "message destroyed");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("buffered", &self.buffer.len())
            .field("messages", &self.core.messages.len())
            .field("stopped", &self.core.stopped)
            .field("half_closed", &self.core.half_closed)
            .field("closed", &self.core.shared.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.core.has_live_messages() {
            self.core.reset_all(true);
        }
        for mut message in self.core.messages.drain_deleted() {
            message.destroy_filters();
            self.core.shared.stats.request_active.dec();
        }
    }
}

#[cfg(test)]
mod tests;
