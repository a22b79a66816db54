//! Multiplexed upstream connections: many requests share one pooled
//! connection and responses are routed back by request id.

use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{Codec, ProtocolError};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::filter::FilterEvent;
use crate::message::{FilterHandle, ResponseDecoder};
use crate::upstream::{
    CloseType, ConnectionPool, OutlierResult, PendingConnection, PoolFailureReason, PoolRequest,
    UpstreamConnection, UpstreamTarget,
};

/// An event for one filter produced by a handler.
#[derive(Debug)]
pub struct HandlerDelivery {
    /// Receiving filter.
    pub target: FilterHandle,
    /// What happened.
    pub event: FilterEvent,
}

impl HandlerDelivery {
    fn new(target: FilterHandle, event: FilterEvent) -> Self {
        Self { target, event }
    }
}

/// One pooled upstream connection shared by many requests.
pub struct UpstreamHandler {
    key: String,
    pool: Arc<dyn ConnectionPool>,
    pending: Option<Box<dyn PendingConnection>>,
    connection: Option<Box<dyn UpstreamConnection>>,
    failure: Option<PoolFailureReason>,
    waiters: Vec<FilterHandle>,
    responses: FxHashMap<u64, FilterHandle>,
    decoder: ResponseDecoder,
}

impl UpstreamHandler {
    /// Registry key of the handler for `host` in `cluster`.
    #[must_use]
    pub fn key_for(cluster: &str, host: SocketAddr) -> String {
        format!("{cluster}_{host}")
    }

    /// Creates a handler and asks `pool` for its connection.
    pub fn start(key: String, pool: Arc<dyn ConnectionPool>, codec: Box<dyn Codec>) -> Self {
        let mut handler = Self {
            key,
            pool,
            pending: None,
            connection: None,
            failure: None,
            waiters: Vec::new(),
            responses: FxHashMap::default(),
            decoder: ResponseDecoder::new(codec),
        };
        match handler
            .pool
            .new_connection(UpstreamTarget::Handler(handler.key.clone()))
        {
            PoolRequest::Pending(pending) => handler.pending = Some(pending),
            PoolRequest::Ready(connection) => {
                // Nobody waits yet, so there is nothing to deliver.
                let _ = handler.on_pool_ready(connection);
            }
            PoolRequest::Failed(reason) => {
                warn!(target: "meta_proxy::upstream", key = %handler.key, ?reason, "pool refused handler connection");
                handler.failure = Some(reason);
            }
        }
        handler
    }

    /// Registry key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` once the connection is established.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection.is_some()
    }

    /// Why the connection could not be established, if it failed.
    #[must_use]
    pub fn failure(&self) -> Option<PoolFailureReason> {
        self.failure
    }

    /// Pool the connection came from.
    #[must_use]
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Address of the upstream host, once connected.
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.connection
            .as_ref()
            .map(|connection| connection.remote_address())
    }

    /// Requests waiting for the connection.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Requests waiting for a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.responses.len()
    }

    /// Queues `target` until the connection is ready or fails.
    pub fn add_waiter(&mut self, target: FilterHandle) {
        self.waiters.push(target);
    }

    /// Routes the response with `request_id` to `target`.
    ///
    /// A duplicate id is logged and ignored; the first registration keeps the
    /// response.
    pub fn add_response_callback(&mut self, request_id: u64, target: FilterHandle) -> bool {
        if self.responses.contains_key(&request_id) {
            warn!(
                target: "meta_proxy::upstream",
                key = %self.key,
                request_id,
                "duplicate request id on multiplexed connection"
            );
            return false;
        }
        self.responses.insert(request_id, target);
        true
    }

    /// Writes request bytes. Returns `false` when the connection is not ready.
    pub fn write(&mut self, data: BytesMut) -> bool {
        match self.connection.as_mut() {
            Some(connection) => {
                connection.write(data, false);
                true
            }
            None => false,
        }
    }

    /// Closes the shared connection.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close(CloseType::NoFlush);
        }
    }

    /// Installs the connection and releases every waiter exactly once.
    pub fn on_pool_ready(
        &mut self,
        mut connection: Box<dyn UpstreamConnection>,
    ) -> Vec<HandlerDelivery> {
        debug!(target: "meta_proxy::upstream", key = %self.key, "multiplexed connection ready");
        self.pending = None;
        self.pool.put_result(OutlierResult::ConnectSuccess);
        connection.add_upstream_callbacks(UpstreamTarget::Handler(self.key.clone()));
        self.connection = Some(connection);
        self.waiters
            .drain(..)
            .map(|target| HandlerDelivery::new(target, FilterEvent::HandlerReady))
            .collect()
    }

    /// Records the failure and fails every waiter exactly once.
    pub fn on_pool_failure(&mut self, reason: PoolFailureReason) -> Vec<HandlerDelivery> {
        warn!(target: "meta_proxy::upstream", key = %self.key, ?reason, "multiplexed connection failed");
        self.pending = None;
        self.failure = Some(reason);
        match reason {
            PoolFailureReason::Timeout => self.pool.put_result(OutlierResult::Timeout),
            PoolFailureReason::RemoteConnectionFailure => {
                self.pool.put_result(OutlierResult::ConnectFailed);
            }
            _ => {}
        }
        self.waiters
            .drain(..)
            .map(|target| HandlerDelivery::new(target, FilterEvent::HandlerFailed(reason)))
            .collect()
    }

    /// Decodes responses and pairs each with the request that registered its
    /// id. Unmatched responses are logged and dropped.
    pub fn on_upstream_data(
        &mut self,
        data: &mut BytesMut,
    ) -> Result<Vec<HandlerDelivery>, ProtocolError> {
        let decoded = self.decoder.decode_all(data)?;
        let mut deliveries = Vec::with_capacity(decoded.len());
        for response in decoded {
            let request_id = response.request_id();
            match self.responses.remove(&request_id) {
                Some(target) => {
                    deliveries.push(HandlerDelivery::new(target, FilterEvent::Response(response)));
                }
                None => warn!(
                    target: "meta_proxy::upstream",
                    key = %self.key,
                    request_id,
                    "no request waits for response, dropping"
                ),
            }
        }
        Ok(deliveries)
    }

    /// Consumes the handler after its connection closed and fails everything
    /// it still owed a response or a connection.
    pub fn on_close(mut self) -> Vec<HandlerDelivery> {
        self.connection = None;
        let mut deliveries: Vec<_> = self
            .waiters
            .drain(..)
            .map(|target| HandlerDelivery::new(target, FilterEvent::HandlerClosed))
            .collect();
        deliveries.extend(
            self.responses
                .drain()
                .map(|(_, target)| HandlerDelivery::new(target, FilterEvent::HandlerClosed)),
        );
        deliveries
    }
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
        if !self.responses.is_empty() {
            self.close();
        }
    }
}

/// Per-connection registry of multiplexed upstream handlers.
#[derive(Default)]
pub struct UpstreamHandlerManager {
    handlers: FxHashMap<String, UpstreamHandler>,
}

impl UpstreamHandlerManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any handler with the same key.
    pub fn add(&mut self, handler: UpstreamHandler) -> &mut UpstreamHandler {
        match self.handlers.entry(handler.key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(handler);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(handler),
        }
    }

    /// Looks up a handler.
    pub fn get(&mut self, key: &str) -> Option<&mut UpstreamHandler> {
        self.handlers.get_mut(key)
    }

    /// Returns the handler for `key`, starting one on `pool` when none exists.
    pub fn get_or_start(
        &mut self,
        key: &str,
        pool: &Arc<dyn ConnectionPool>,
        codec: impl FnOnce() -> Box<dyn Codec>,
    ) -> &mut UpstreamHandler {
        self.handlers.entry(key.to_owned()).or_insert_with(|| {
            debug!(target: "meta_proxy::upstream", key, "starting multiplexed handler");
            UpstreamHandler::start(key.to_owned(), Arc::clone(pool), codec())
        })
    }

    /// Unregisters a handler.
    pub fn del(&mut self, key: &str) -> Option<UpstreamHandler> {
        self.handlers.remove(key)
    }

    /// Drops every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` when no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
