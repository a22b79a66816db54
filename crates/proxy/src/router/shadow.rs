//! Mirrored requests. A shadow copy is written to its cluster and the answer
//! is decoded only to know when the connection can be released.

use std::sync::Arc;

use bytes::BytesMut;
use codec::{Codec, ResponseStatus};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::message::ResponseDecoder;
use crate::upstream::{
    CloseType, ConnectionPool, OutlierResult, PendingConnection, PoolRequest, UpstreamConnection,
    UpstreamEvent, UpstreamTarget,
};

struct ShadowRequest {
    cluster: String,
    pool: Arc<dyn ConnectionPool>,
    request: Option<BytesMut>,
    one_way: bool,
    pending: Option<Box<dyn PendingConnection>>,
    connection: Option<Box<dyn UpstreamConnection>>,
    decoder: ResponseDecoder,
}

impl ShadowRequest {
    /// Writes the request. Returns `true` when nothing else is expected.
    fn on_ready(&mut self, id: u64, mut connection: Box<dyn UpstreamConnection>) -> bool {
        self.pending = None;
        self.pool.put_result(OutlierResult::ConnectSuccess);
        if let Some(request) = self.request.take() {
            connection.write(request, false);
        }
        if self.one_way {
            return true;
        }
        connection.add_upstream_callbacks(UpstreamTarget::Shadow(id));
        self.connection = Some(connection);
        false
    }
}

impl Drop for ShadowRequest {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}

/// Mirrored requests of one downstream connection.
#[derive(Default)]
pub(crate) struct ShadowRequests {
    next_id: u64,
    requests: FxHashMap<u64, ShadowRequest>,
}

impl ShadowRequests {
    pub(crate) fn submit(
        &mut self,
        cluster: &str,
        pool: Arc<dyn ConnectionPool>,
        request: BytesMut,
        one_way: bool,
        codec: Box<dyn Codec>,
    ) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let mut shadow = ShadowRequest {
            cluster: cluster.to_owned(),
            pool: Arc::clone(&pool),
            request: Some(request),
            one_way,
            pending: None,
            connection: None,
            decoder: ResponseDecoder::new(codec),
        };
        debug!(target: "meta_proxy::router", cluster, shadow_id = id, "submitting shadow request");
        match pool.new_connection(UpstreamTarget::Shadow(id)) {
            PoolRequest::Pending(pending) => {
                shadow.pending = Some(pending);
                self.requests.insert(id, shadow);
            }
            PoolRequest::Ready(connection) => {
                if !shadow.on_ready(id, connection) {
                    self.requests.insert(id, shadow);
                }
            }
            PoolRequest::Failed(reason) => {
                warn!(target: "meta_proxy::router", cluster, ?reason, "shadow request submit failure");
            }
        }
    }

    pub(crate) fn on_event(&mut self, id: u64, event: UpstreamEvent) {
        let Some(shadow) = self.requests.get_mut(&id) else {
            return;
        };
        let finished = match event {
            UpstreamEvent::PoolReady(connection) => shadow.on_ready(id, connection),
            UpstreamEvent::PoolFailure(reason) => {
                warn!(target: "meta_proxy::router", cluster = %shadow.cluster, ?reason, "shadow connection failed");
                shadow.pending = None;
                true
            }
            UpstreamEvent::Data { mut data, .. } => match shadow.decoder.decode_one(&mut data) {
                Ok(Some(response)) => {
                    shadow.pool.put_result(
                        if response.response_status() == ResponseStatus::Ok {
                            OutlierResult::RequestSuccess
                        } else {
                            OutlierResult::RequestFailed
                        },
                    );
                    true
                }
                Ok(None) => false,
                Err(error) => {
                    warn!(target: "meta_proxy::router", cluster = %shadow.cluster, %error, "undecodable shadow response");
                    if let Some(connection) = shadow.connection.as_mut() {
                        connection.close(CloseType::NoFlush);
                    }
                    true
                }
            },
            UpstreamEvent::Connection(event) => event.is_close(),
        };
        if finished {
            self.requests.remove(&id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Abandons every shadow request, closing connections still in use.
    pub(crate) fn clear(&mut self) {
        for (_, mut shadow) in self.requests.drain() {
            if let Some(mut connection) = shadow.connection.take() {
                connection.close(CloseType::NoFlush);
            }
        }
    }
}
