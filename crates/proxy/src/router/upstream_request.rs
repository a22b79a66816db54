//! One request's exclusive use of a pooled upstream connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{Codec, ErrorType, HEADER_REAL_SERVER_ADDRESS, MessageType, ResponseStatus};
use tracing::{debug, warn};

use crate::filter::{DecoderFilterCallbacks, FilterStatus};
use crate::reply::AppException;
use crate::upstream::{
    CloseType, ConnectionEvent, ConnectionPool, OutlierResult, PendingConnection,
    PoolFailureReason, PoolRequest, UpstreamConnection, UpstreamTarget,
};

const LOG_TARGET: &str = "meta_proxy::router";

/// Text of the error reply sent for a pool failure.
pub(crate) fn failure_message(reason: PoolFailureReason, host: Option<SocketAddr>) -> String {
    let host = host.map_or_else(String::new, |host| host.to_string());
    match reason {
        PoolFailureReason::Overflow => {
            "meta protocol upstream request: too many connections".to_owned()
        }
        PoolFailureReason::LocalConnectionFailure => {
            format!("local connection failure '{host}'")
        }
        PoolFailureReason::RemoteConnectionFailure => {
            format!("remote connection failure '{host}'")
        }
        PoolFailureReason::Timeout => format!("connection failure '{host}' due to timeout"),
    }
}

/// Outlier result for a completed response.
pub(crate) fn response_outlier(status: ResponseStatus, message_type: MessageType) -> OutlierResult {
    match (status, message_type) {
        (ResponseStatus::Ok, MessageType::Error) | (ResponseStatus::Error, _) => {
            OutlierResult::RequestFailed
        }
        (ResponseStatus::Ok, _) => OutlierResult::RequestSuccess,
    }
}

pub(crate) struct UpstreamRequest {
    pool: Arc<dyn ConnectionPool>,
    message_type: MessageType,
    request: BytesMut,
    codec: Option<Box<dyn Codec>>,
    pending: Option<Box<dyn PendingConnection>>,
    connection: Option<Box<dyn UpstreamConnection>>,
    host: Option<SocketAddr>,
    response_started: bool,
    response_complete: bool,
}

impl UpstreamRequest {
    pub(crate) fn new(
        pool: Arc<dyn ConnectionPool>,
        message_type: MessageType,
        request: BytesMut,
    ) -> Self {
        Self {
            pool,
            message_type,
            request,
            codec: None,
            pending: None,
            connection: None,
            host: None,
            response_started: false,
            response_complete: false,
        }
    }

    pub(crate) fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Nothing more is expected from upstream.
    pub(crate) fn finished(&self) -> bool {
        self.response_complete || (self.pending.is_none() && self.connection.is_none())
    }

    pub(crate) const fn response_complete(&self) -> bool {
        self.response_complete
    }

    /// Asks the pool for a connection.
    pub(crate) fn start(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) -> FilterStatus {
        let target = UpstreamTarget::Filter(callbacks.target());
        match self.pool.new_connection(target) {
            PoolRequest::Pending(pending) => {
                debug!(target: LOG_TARGET, stream_id = callbacks.stream_id(), host = %self.pool.host(), "waiting for upstream connection");
                self.pending = Some(pending);
                FilterStatus::PauseIteration
            }
            PoolRequest::Ready(connection) => {
                self.on_pool_ready(connection, callbacks);
                FilterStatus::ContinueIteration
            }
            PoolRequest::Failed(reason) => {
                self.on_pool_failure(reason, callbacks);
                FilterStatus::ContinueIteration
            }
        }
    }

    /// Writes the request on `connection`.
    pub(crate) fn on_pool_ready(
        &mut self,
        mut connection: Box<dyn UpstreamConnection>,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        let was_pending = self.pending.take().is_some();
        let host = connection.remote_address();
        self.host = Some(host);
        self.pool.put_result(OutlierResult::ConnectSuccess);
        debug!(
            target: LOG_TARGET,
            stream_id = callbacks.stream_id(),
            request_id = callbacks.request_id(),
            %host,
            "upstream connection ready"
        );
        if self.message_type == MessageType::Request {
            connection.add_upstream_callbacks(UpstreamTarget::Filter(callbacks.target()));
        }
        callbacks
            .metadata_mut()
            .put_string(HEADER_REAL_SERVER_ADDRESS, host.to_string());
        if was_pending {
            callbacks.continue_decoding();
        }

        let mut data = std::mem::take(&mut self.request);
        let codec = self.codec.get_or_insert_with(|| callbacks.create_codec());
        if let Err(error) = codec.encode(callbacks.metadata(), callbacks.mutation(), &mut data) {
            warn!(target: LOG_TARGET, request_id = callbacks.request_id(), %error, "request rewrite failed, forwarding unchanged");
        }
        connection.write(data, false);

        match self.message_type {
            MessageType::StreamInit => {
                self.response_complete = true;
                callbacks.reset_stream();
                callbacks.set_upstream_connection(connection);
            }
            MessageType::Oneway => {
                self.response_complete = true;
                drop(connection);
            }
            _ => self.connection = Some(connection),
        }
    }

    pub(crate) fn on_pool_failure(
        &mut self,
        reason: PoolFailureReason,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        warn!(target: LOG_TARGET, stream_id = callbacks.stream_id(), ?reason, host = %self.pool.host(), "upstream connection failed");
        self.pending = None;
        self.request.clear();
        self.on_connection_reset(reason, callbacks);
        match reason {
            PoolFailureReason::Timeout => self.pool.put_result(OutlierResult::Timeout),
            PoolFailureReason::RemoteConnectionFailure => {
                self.pool.put_result(OutlierResult::ConnectFailed);
            }
            _ => {}
        }
        if reason.is_connection_failure() {
            callbacks.continue_decoding();
        }
    }

    /// Answers the downstream for a connection that broke before the
    /// response completed. One-way requests are only reset.
    pub(crate) fn on_connection_reset(
        &mut self,
        reason: PoolFailureReason,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        if self.message_type == MessageType::Oneway {
            callbacks.reset_stream();
            return;
        }
        let host = self.host.or_else(|| Some(self.pool.host()));
        let reply = AppException::new(ErrorType::Unspecified, failure_message(reason, host));
        callbacks.send_local_reply(&reply, false);
        if !self.response_complete {
            callbacks.reset_stream();
        }
    }

    pub(crate) fn on_connection_event(
        &mut self,
        event: ConnectionEvent,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        match event {
            ConnectionEvent::RemoteClose => {
                debug!(target: LOG_TARGET, stream_id = callbacks.stream_id(), "upstream closed the connection");
                self.connection = None;
                self.on_connection_reset(PoolFailureReason::RemoteConnectionFailure, callbacks);
                self.pool.put_result(OutlierResult::ConnectFailed);
            }
            ConnectionEvent::LocalClose => {
                debug!(target: LOG_TARGET, stream_id = callbacks.stream_id(), "upstream connection closed locally");
                self.connection = None;
                self.on_connection_reset(PoolFailureReason::LocalConnectionFailure, callbacks);
            }
            ConnectionEvent::Connected => {}
        }
    }

    /// Starts the response decoder on the first upstream packet.
    pub(crate) fn start_response(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) {
        if !self.response_started {
            self.response_started = true;
            callbacks.start_upstream_response();
        }
    }

    /// The response completed; the connection goes back to its pool.
    pub(crate) fn on_response_complete(&mut self) {
        self.response_complete = true;
        self.connection = None;
    }

    /// Gives up on the upstream connection, closing it when `close` is set.
    pub(crate) fn release(&mut self, close: bool) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
        if let Some(mut connection) = self.connection.take()
            && close
        {
            connection.close(CloseType::NoFlush);
        }
    }
}

impl Drop for UpstreamRequest {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}
