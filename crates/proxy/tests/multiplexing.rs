use std::sync::Arc;

use codec::{CodecKind, ResponseStatus, frames};
use proxy::route::RouteConfig;
use proxy::{
    ClusterManager, ConnectionEvent, ConnectionManager, OutlierResult, PoolFailureReason,
    ProxyConfig, RouterFactory, UpstreamEvent, UpstreamHandler, UpstreamTarget,
};
use test_support::{PoolStep, RecordingDownstream, ScriptedPool, StaticClusters, addr};

const HOST: &str = "10.0.1.1:20880";

fn multiplexed(step: PoolStep) -> (ConnectionManager, RecordingDownstream, Arc<ScriptedPool>) {
    let routes: RouteConfig =
        serde_json::from_str(r#"{"routes": [{"cluster": "users"}]}"#).unwrap();
    let pool = ScriptedPool::new(addr(HOST), step);
    let clusters: Arc<dyn ClusterManager> =
        Arc::new(StaticClusters::new().with_cluster("users", &pool));
    let config = ProxyConfig::builder(CodecKind::Dubbo)
        .routes(&routes)
        .unwrap()
        .filter(Arc::new(RouterFactory::new(clusters, true)))
        .build();
    let downstream = RecordingDownstream::default();
    let manager = ConnectionManager::with_seed(Arc::new(config), downstream.boxed(), 3);
    (manager, downstream, pool)
}

fn handler_target() -> UpstreamTarget {
    UpstreamTarget::Handler(UpstreamHandler::key_for("users", addr(HOST)))
}

fn request_ids(metadata: &[codec::Metadata]) -> Vec<u64> {
    metadata.iter().map(codec::Metadata::request_id).collect()
}

#[test]
fn responses_are_matched_by_request_id() {
    let (mut manager, downstream, pool) = multiplexed(PoolStep::Ready);
    let mut bytes = frames::dubbo::request(1, "svc", "A");
    bytes.unsplit(frames::dubbo::request(2, "svc", "B"));
    manager.on_data(bytes, false);

    assert_eq!(pool.connections().len(), 1, "requests share one connection");
    let upstream = &pool.connections()[0];
    assert_eq!(request_ids(&upstream.requests(CodecKind::Dubbo)), [1, 2]);
    assert_eq!(upstream.callbacks(), [handler_target()]);
    assert_eq!(manager.upstream_handlers(), 1);

    let mut responses = frames::dubbo::response(2, b"two");
    responses.unsplit(frames::dubbo::response(1, b"one"));
    manager.on_upstream_event(
        handler_target(),
        UpstreamEvent::Data {
            data: responses,
            end_stream: false,
        },
    );

    assert_eq!(
        request_ids(&downstream.responses(CodecKind::Dubbo)),
        [2, 1]
    );
    assert_eq!(manager.active_messages(), 0);
    assert_eq!(manager.upstream_handlers(), 1, "connection stays for later requests");
    assert_eq!(
        pool.results(),
        [
            OutlierResult::ConnectSuccess,
            OutlierResult::RequestSuccess,
            OutlierResult::RequestSuccess
        ]
    );
}

#[test]
fn unmatched_response_is_dropped() {
    let (mut manager, downstream, _) = multiplexed(PoolStep::Ready);
    manager.on_data(frames::dubbo::request(1, "svc", "A"), false);
    manager.on_upstream_event(
        handler_target(),
        UpstreamEvent::Data {
            data: frames::dubbo::response(5, b"stray"),
            end_stream: false,
        },
    );
    assert_eq!(downstream.write_count(), 0);
    assert_eq!(manager.active_messages(), 1);
}

#[test]
fn waiting_request_is_released_once_connection_is_ready() {
    let (mut manager, downstream, pool) = multiplexed(PoolStep::Pending);
    let mut bytes = frames::dubbo::request(1, "svc", "A");
    bytes.unsplit(frames::dubbo::request(2, "svc", "B"));
    manager.on_data(bytes, false);

    assert!(manager.is_stopped());
    assert_eq!(pool.targets(), [handler_target()]);
    assert_eq!(manager.stats().request_decoding_success.value(), 1);

    let (connection, upstream) = pool.connection();
    manager.on_upstream_event(handler_target(), UpstreamEvent::PoolReady(connection));

    assert!(!manager.is_stopped());
    assert_eq!(pool.targets().len(), 1, "second request reuses the handler");
    assert_eq!(request_ids(&upstream.requests(CodecKind::Dubbo)), [1, 2]);
    assert_eq!(manager.stats().request.value(), 2);

    let (second, _) = pool.connection();
    manager.on_upstream_event(handler_target(), UpstreamEvent::PoolReady(second));
    assert_eq!(request_ids(&upstream.requests(CodecKind::Dubbo)), [1, 2]);
    assert_eq!(downstream.write_count(), 0);
}

#[test]
fn handler_failure_answers_every_waiter() {
    let (mut manager, downstream, pool) = multiplexed(PoolStep::Pending);
    manager.on_data(frames::dubbo::request(1, "svc", "A"), false);
    manager.on_upstream_event(
        handler_target(),
        UpstreamEvent::PoolFailure(PoolFailureReason::Timeout),
    );

    let replies = downstream.responses(CodecKind::Dubbo);
    assert_eq!(request_ids(&replies), [1]);
    assert_eq!(pool.results(), [OutlierResult::Timeout]);
    assert_eq!(manager.upstream_handlers(), 0);
    assert_eq!(manager.active_messages(), 0);
    assert!(!manager.is_stopped());

    // The next request starts a fresh handler.
    manager.on_data(frames::dubbo::request(2, "svc", "A"), false);
    assert_eq!(pool.targets().len(), 2);
    assert_eq!(manager.upstream_handlers(), 1);
}

#[test]
fn handler_close_fails_requests_in_flight() {
    let (mut manager, downstream, pool) = multiplexed(PoolStep::Ready);
    let mut bytes = frames::dubbo::request(1, "svc", "A");
    bytes.unsplit(frames::dubbo::request(2, "svc", "B"));
    manager.on_data(bytes, false);
    assert_eq!(manager.active_messages(), 2);

    manager.on_upstream_event(
        handler_target(),
        UpstreamEvent::Connection(ConnectionEvent::RemoteClose),
    );

    let mut replies = request_ids(&downstream.responses(CodecKind::Dubbo));
    replies.sort_unstable();
    assert_eq!(replies, [1, 2]);
    assert_eq!(manager.upstream_handlers(), 0);
    assert_eq!(manager.active_messages(), 0);
    assert_eq!(pool.connections().len(), 1);
}

#[test]
fn one_way_requests_bypass_the_shared_connection() {
    let (mut manager, _, pool) = multiplexed(PoolStep::Ready);
    manager.on_data(frames::dubbo::oneway(9, "svc", "A"), false);

    assert_eq!(manager.upstream_handlers(), 0);
    let upstream = &pool.connections()[0];
    assert!(upstream.released());
    assert!(matches!(pool.targets()[0], UpstreamTarget::Filter(_)));
}

#[test]
fn duplicate_request_id_is_rejected_without_reaching_upstream() {
    let (mut manager, downstream, pool) = multiplexed(PoolStep::Ready);
    let mut bytes = frames::dubbo::request(7, "svc", "A");
    bytes.unsplit(frames::dubbo::request(7, "svc", "B"));
    manager.on_data(bytes, false);

    let upstream = &pool.connections()[0];
    assert_eq!(request_ids(&upstream.requests(CodecKind::Dubbo)), [7]);
    let replies = downstream.responses(CodecKind::Dubbo);
    assert_eq!(request_ids(&replies), [7]);
    assert_eq!(replies[0].response_status(), ResponseStatus::Error);
    assert_eq!(manager.active_messages(), 1);

    manager.on_upstream_event(
        handler_target(),
        UpstreamEvent::Data {
            data: frames::dubbo::response(7, b"first"),
            end_stream: false,
        },
    );

    let replies = downstream.responses(CodecKind::Dubbo);
    assert_eq!(request_ids(&replies), [7, 7]);
    assert_eq!(replies[1].response_status(), ResponseStatus::Ok);
    assert_eq!(manager.active_messages(), 0);
    assert_eq!(manager.upstream_handlers(), 1);
}

#[test]
fn duplicate_id_queued_behind_pending_connection_is_rejected() {
    let (mut manager, downstream, pool) = multiplexed(PoolStep::Pending);
    let mut bytes = frames::dubbo::request(4, "svc", "A");
    bytes.unsplit(frames::dubbo::request(4, "svc", "B"));
    manager.on_data(bytes, false);
    assert_eq!(downstream.write_count(), 0);

    let (connection, upstream) = pool.connection();
    manager.on_upstream_event(handler_target(), UpstreamEvent::PoolReady(connection));

    assert_eq!(request_ids(&upstream.requests(CodecKind::Dubbo)), [4]);
    let replies = downstream.responses(CodecKind::Dubbo);
    assert_eq!(request_ids(&replies), [4]);
    assert_eq!(replies[0].response_status(), ResponseStatus::Error);
    assert_eq!(manager.active_messages(), 1);
}
