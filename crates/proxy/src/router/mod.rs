//! crates/proxy/src/router/mod.rs
//!
//! Terminal decoder filter. Picks a route and a cluster, borrows an upstream
//! connection, writes the request and relays the response back through the
//! message's response decoder.
//!
//! Two upstream modes exist. By default each request takes a pooled
//! connection for itself and returns it when the response completes. With
//! multiplexing, two-way requests share one connection per host through an
//! [`UpstreamHandler`] and responses are matched by request id.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{ErrorType, HEADER_REAL_SERVER_ADDRESS, MessageType};
use tracing::{debug, warn};

use crate::filter::{
    DecoderFilter, DecoderFilterCallbacks, FilterChainBuilder, FilterEvent, FilterFactory,
    FilterStatus, UpstreamResponseStatus,
};
use crate::reply::AppException;
use crate::route::Route;
use crate::upstream::{
    ClusterManager, ConnectionPool, LoadBalancerContext, PoolFailureReason, UpstreamEvent,
    UpstreamHandler,
};

mod shadow;
mod upstream_request;

pub(crate) use shadow::ShadowRequests;
use upstream_request::{UpstreamRequest, failure_message, response_outlier};

const LOG_TARGET: &str = "meta_proxy::router";

/// A request routed to a shared multiplexed connection.
struct MultiplexedRequest {
    key: String,
    request_id: u64,
    pool: Arc<dyn ConnectionPool>,
    /// Encoded request, until the shared connection is ready.
    request: Option<BytesMut>,
    complete: bool,
}

enum HandlerState {
    Ready(Option<SocketAddr>),
    Waiting,
    Failed(PoolFailureReason),
    DuplicateId,
}

/// The router filter.
pub struct Router {
    cluster_manager: Arc<dyn ClusterManager>,
    multiplexing: bool,
    route: Option<Route>,
    upstream: Option<UpstreamRequest>,
    multiplexed: Option<MultiplexedRequest>,
}

impl Router {
    /// Creates a router that takes pools from `cluster_manager`.
    pub fn new(cluster_manager: Arc<dyn ClusterManager>, multiplexing: bool) -> Self {
        Self {
            cluster_manager,
            multiplexing,
            route: None,
            upstream: None,
            multiplexed: None,
        }
    }

    /// Route chosen for the current request.
    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    fn reject(
        callbacks: &mut dyn DecoderFilterCallbacks,
        kind: ErrorType,
        message: String,
    ) -> FilterStatus {
        debug!(target: LOG_TARGET, request_id = callbacks.request_id(), ?kind, %message, "request rejected");
        callbacks.send_local_reply(&AppException::new(kind, message), false);
        FilterStatus::AbortIteration
    }

    fn submit_mirrors(
        &self,
        route: &Route,
        context: &LoadBalancerContext,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        for policy in route.mirror_policies() {
            if !policy.should_mirror(callbacks.stream_id()) {
                continue;
            }
            let cluster = policy.cluster();
            match self.cluster_manager.get(cluster) {
                Some(info) if !info.maintenance_mode => {}
                Some(_) => {
                    debug!(target: LOG_TARGET, cluster, "shadow cluster in maintenance, skipping");
                    continue;
                }
                None => {
                    warn!(target: LOG_TARGET, cluster, "unknown shadow cluster");
                    continue;
                }
            }
            match self.cluster_manager.tcp_conn_pool(cluster, context) {
                Some(pool) => callbacks.submit_shadow(cluster, pool),
                None => debug!(target: LOG_TARGET, cluster, "no healthy host for shadow request"),
            }
        }
    }

    fn start_multiplexed(
        &mut self,
        cluster: &str,
        pool: Arc<dyn ConnectionPool>,
        mut request: BytesMut,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) -> FilterStatus {
        let key = UpstreamHandler::key_for(cluster, pool.host());
        let target = callbacks.target();
        let request_id = callbacks.request_id();

        let mut codec = callbacks.create_codec();
        if let Err(error) = codec.encode(callbacks.metadata(), callbacks.mutation(), &mut request) {
            warn!(target: LOG_TARGET, request_id, %error, "request rewrite failed, forwarding unchanged");
        }
        let handler_codec = callbacks.create_codec();

        let mut request = Some(request);
        let state = {
            let handler =
                callbacks
                    .upstream_handlers()
                    .get_or_start(&key, &pool, move || handler_codec);
            if let Some(reason) = handler.failure() {
                HandlerState::Failed(reason)
            } else if handler.is_ready() {
                if handler.add_response_callback(request_id, target) {
                    if let Some(request) = request.take() {
                        handler.write(request);
                    }
                    HandlerState::Ready(handler.remote_address())
                } else {
                    HandlerState::DuplicateId
                }
            } else {
                handler.add_waiter(target);
                HandlerState::Waiting
            }
        };

        let mut multiplexed = MultiplexedRequest {
            key,
            request_id,
            pool,
            request,
            complete: false,
        };
        let status = match state {
            HandlerState::Ready(address) => {
                if let Some(address) = address {
                    callbacks
                        .metadata_mut()
                        .put_string(HEADER_REAL_SERVER_ADDRESS, address.to_string());
                }
                FilterStatus::ContinueIteration
            }
            HandlerState::Waiting => {
                debug!(target: LOG_TARGET, key = %multiplexed.key, request_id, "waiting for multiplexed connection");
                FilterStatus::PauseIteration
            }
            HandlerState::Failed(reason) => {
                callbacks.upstream_handlers().del(&multiplexed.key);
                multiplexed.complete = true;
                let host = Some(multiplexed.pool.host());
                let reply = AppException::new(ErrorType::Unspecified, failure_message(reason, host));
                callbacks.send_local_reply(&reply, false);
                FilterStatus::AbortIteration
            }
            HandlerState::DuplicateId => {
                Self::reject_duplicate_id(&mut multiplexed, callbacks);
                FilterStatus::AbortIteration
            }
        };
        self.multiplexed = Some(multiplexed);
        status
    }

    fn on_multiplexed_event(
        &mut self,
        event: FilterEvent,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        let Some(multiplexed) = self.multiplexed.as_mut() else {
            return;
        };
        if multiplexed.complete {
            return;
        }
        match event {
            FilterEvent::HandlerReady => {
                let target = callbacks.target();
                let request = multiplexed.request.take();
                let state = match callbacks.upstream_handlers().get(&multiplexed.key) {
                    Some(handler) if handler.is_ready() => {
                        if handler.add_response_callback(multiplexed.request_id, target) {
                            if let Some(request) = request {
                                handler.write(request);
                            }
                            HandlerState::Ready(handler.remote_address())
                        } else {
                            HandlerState::DuplicateId
                        }
                    }
                    _ => HandlerState::Failed(PoolFailureReason::RemoteConnectionFailure),
                };
                match state {
                    HandlerState::Ready(address) => {
                        if let Some(address) = address {
                            callbacks
                                .metadata_mut()
                                .put_string(HEADER_REAL_SERVER_ADDRESS, address.to_string());
                        }
                        debug!(target: LOG_TARGET, key = %multiplexed.key, request_id = multiplexed.request_id, "request sent on multiplexed connection");
                    }
                    HandlerState::DuplicateId => Self::reject_duplicate_id(multiplexed, callbacks),
                    HandlerState::Failed(reason) => {
                        Self::fail_multiplexed(multiplexed, reason, callbacks);
                    }
                    HandlerState::Waiting => {}
                }
                callbacks.continue_decoding();
            }
            FilterEvent::HandlerFailed(reason) => {
                Self::fail_multiplexed(multiplexed, reason, callbacks);
                callbacks.continue_decoding();
            }
            FilterEvent::HandlerClosed => {
                Self::fail_multiplexed(
                    multiplexed,
                    PoolFailureReason::RemoteConnectionFailure,
                    callbacks,
                );
                callbacks.continue_decoding();
            }
            FilterEvent::Response(response) => {
                match callbacks.upstream_response(response) {
                    UpstreamResponseStatus::Complete => {
                        if let Some(response) = callbacks.response_metadata() {
                            multiplexed.pool.put_result(response_outlier(
                                response.response_status(),
                                response.message_type(),
                            ));
                        }
                        multiplexed.complete = true;
                    }
                    UpstreamResponseStatus::Reset => multiplexed.complete = true,
                    UpstreamResponseStatus::Retry => {
                        warn!(target: LOG_TARGET, request_id = multiplexed.request_id, "retry is not supported on multiplexed connections");
                        multiplexed.complete = true;
                        Self::reply_retry_unsupported(callbacks);
                    }
                    UpstreamResponseStatus::MoreData => {}
                }
            }
            FilterEvent::Upstream(event) => {
                debug!(target: LOG_TARGET, ?event, "unexpected upstream event for multiplexed request");
            }
        }
    }

    fn fail_multiplexed(
        multiplexed: &mut MultiplexedRequest,
        reason: PoolFailureReason,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        multiplexed.complete = true;
        multiplexed.request = None;
        let host = Some(multiplexed.pool.host());
        let reply = AppException::new(ErrorType::Unspecified, failure_message(reason, host));
        callbacks.send_local_reply(&reply, false);
        callbacks.reset_stream();
    }

    /// The shared connection already carries a request with this id; its
    /// response could not be told apart, so the request is never sent.
    fn reject_duplicate_id(
        multiplexed: &mut MultiplexedRequest,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) {
        multiplexed.complete = true;
        multiplexed.request = None;
        let reply = AppException::new(
            ErrorType::Unspecified,
            format!(
                "meta protocol upstream request: request id {} already in flight on {}",
                multiplexed.request_id,
                multiplexed.pool.host()
            ),
        );
        callbacks.send_local_reply(&reply, false);
        callbacks.reset_stream();
    }

    fn reply_retry_unsupported(callbacks: &mut dyn DecoderFilterCallbacks) {
        let reply = AppException::new(
            ErrorType::Unspecified,
            "meta protocol upstream request: retry is not supported",
        );
        callbacks.send_local_reply(&reply, false);
        callbacks.reset_stream();
    }

    fn on_upstream_event(&mut self, event: UpstreamEvent, callbacks: &mut dyn DecoderFilterCallbacks) {
        let Some(upstream) = self.upstream.as_mut() else {
            debug!(target: LOG_TARGET, ?event, "upstream event without an upstream request");
            return;
        };
        match event {
            UpstreamEvent::PoolReady(connection) => upstream.on_pool_ready(connection, callbacks),
            UpstreamEvent::PoolFailure(reason) => upstream.on_pool_failure(reason, callbacks),
            UpstreamEvent::Data {
                mut data,
                end_stream,
            } => {
                upstream.start_response(callbacks);
                match callbacks.upstream_data(&mut data) {
                    UpstreamResponseStatus::Complete => {
                        if let Some(response) = callbacks.response_metadata() {
                            upstream.pool().put_result(response_outlier(
                                response.response_status(),
                                response.message_type(),
                            ));
                        }
                        upstream.on_response_complete();
                    }
                    UpstreamResponseStatus::Reset => {
                        upstream.release(true);
                        upstream.on_response_complete();
                    }
                    UpstreamResponseStatus::Retry => {
                        warn!(target: LOG_TARGET, request_id = callbacks.request_id(), "retry requested, upstream request already consumed");
                        upstream.release(true);
                        upstream.on_response_complete();
                        Self::reply_retry_unsupported(callbacks);
                    }
                    UpstreamResponseStatus::MoreData if end_stream => {
                        upstream.on_connection_reset(
                            PoolFailureReason::RemoteConnectionFailure,
                            callbacks,
                        );
                        upstream.on_response_complete();
                    }
                    UpstreamResponseStatus::MoreData => {}
                }
            }
            UpstreamEvent::Connection(event) => {
                if !upstream.response_complete() {
                    upstream.on_connection_event(event, callbacks);
                }
            }
        }
    }
}

impl DecoderFilter for Router {
    fn on_message_decoded(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) -> FilterStatus {
        if self.upstream.is_some() || self.multiplexed.is_some() {
            warn!(target: LOG_TARGET, request_id = callbacks.request_id(), "router invoked twice for one request");
            return FilterStatus::ContinueIteration;
        }
        let message_type = callbacks.metadata().message_type();
        let Some(route) = callbacks.route() else {
            let message = format!("no route for request {}", callbacks.request_id());
            return Self::reject(callbacks, ErrorType::RouteNotFound, message);
        };
        let cluster_name = route.cluster_name().to_owned();
        let Some(cluster) = self.cluster_manager.get(&cluster_name) else {
            return Self::reject(
                callbacks,
                ErrorType::ClusterNotFound,
                format!("unknown cluster '{cluster_name}'"),
            );
        };
        if cluster.maintenance_mode {
            return Self::reject(
                callbacks,
                ErrorType::Unspecified,
                format!("maintenance mode for cluster '{cluster_name}'"),
            );
        }
        let context = LoadBalancerContext {
            hash_key: route.hash_policy().generate_hash(callbacks.metadata()),
            downstream: callbacks.downstream_address(),
        };
        let Some(pool) = self.cluster_manager.tcp_conn_pool(&cluster_name, &context) else {
            return Self::reject(
                callbacks,
                ErrorType::NoHealthyUpstream,
                format!("no healthy upstream for '{cluster_name}'"),
            );
        };
        debug!(
            target: LOG_TARGET,
            request_id = callbacks.request_id(),
            cluster = %cluster_name,
            host = %pool.host(),
            message_type = message_type.as_str(),
            "routing request"
        );

        route.apply_request_mutation(callbacks.mutation_mut());
        self.submit_mirrors(&route, &context, callbacks);
        let request = callbacks.metadata_mut().take_origin_message();
        self.route = Some(route);

        if self.multiplexing && message_type == MessageType::Request {
            return self.start_multiplexed(&cluster_name, pool, request, callbacks);
        }
        let mut upstream = UpstreamRequest::new(pool, message_type, request);
        let status = upstream.start(callbacks);
        self.upstream = Some(upstream);
        status
    }

    fn on_event(&mut self, event: FilterEvent, callbacks: &mut dyn DecoderFilterCallbacks) {
        match event {
            FilterEvent::Upstream(event) => self.on_upstream_event(event, callbacks),
            other => self.on_multiplexed_event(other, callbacks),
        }
    }

    fn on_destroy(&mut self) {
        if let Some(upstream) = self.upstream.as_mut()
            && !upstream.finished()
        {
            debug!(target: LOG_TARGET, "releasing unfinished upstream request");
            upstream.release(true);
        }
    }
}

/// Creates a [`Router`] per message.
pub struct RouterFactory {
    cluster_manager: Arc<dyn ClusterManager>,
    multiplexing: bool,
}

impl RouterFactory {
    /// Routers created by this factory share `cluster_manager`.
    pub fn new(cluster_manager: Arc<dyn ClusterManager>, multiplexing: bool) -> Self {
        Self {
            cluster_manager,
            multiplexing,
        }
    }
}

impl FilterFactory for RouterFactory {
    fn name(&self) -> &'static str {
        "router"
    }

    fn create_filters(&self, chain: &mut FilterChainBuilder) {
        chain.add_decoder_filter(Box::new(Router::new(
            Arc::clone(&self.cluster_manager),
            self.multiplexing,
        )));
    }
}
