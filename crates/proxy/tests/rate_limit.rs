use std::sync::Arc;
use std::time::{Duration, Instant};

use codec::error_codes::DubboStatus;
use codec::{CodecKind, ResponseStatus, frames};
use proxy::route::RouteConfig;
use proxy::{ClusterManager, ConnectionManager, FilterConfig, ProxyConfig};
use test_support::{PoolStep, RecordingDownstream, ScriptedPool, StaticClusters, addr};

fn limited(filters: &str) -> (ProxyConfig, Arc<ScriptedPool>) {
    let routes: RouteConfig =
        serde_json::from_str(r#"{"routes": [{"cluster": "orders"}]}"#).unwrap();
    let filters: Vec<FilterConfig> = serde_json::from_str(filters).unwrap();
    let pool = ScriptedPool::new(addr("10.0.3.1:20880"), PoolStep::Ready);
    let clusters: Arc<dyn ClusterManager> =
        Arc::new(StaticClusters::new().with_cluster("orders", &pool));
    let config = ProxyConfig::builder(CodecKind::Dubbo)
        .routes(&routes)
        .unwrap()
        .filter_configs(&filters, &clusters)
        .unwrap()
        .build();
    (config, pool)
}

#[test]
fn requests_over_the_bucket_get_over_limit_replies() {
    let (config, pool) = limited(
        r#"[
            {"name": "local_ratelimit", "config": {"token_bucket": {"max_tokens": 2, "fill_interval_ms": 1000}}},
            {"name": "router", "config": {}}
        ]"#,
    );
    assert_eq!(config.rate_limiters().len(), 1);
    let limiter = Arc::clone(&config.rate_limiters()[0]);
    let downstream = RecordingDownstream::default();
    let mut manager = ConnectionManager::with_seed(Arc::new(config), downstream.boxed(), 1);

    for id in 1..=3 {
        manager.on_data(frames::dubbo::oneway(id, "svc", "Put"), false);
    }
    assert_eq!(pool.connections().len(), 2);

    let replies = downstream.responses(CodecKind::Dubbo);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].request_id(), 3);
    assert_eq!(replies[0].response_status(), ResponseStatus::Error);
    assert_eq!(
        replies[0].get_u32("dubbo_status"),
        DubboStatus::ServerThreadpoolExhausted as u32
    );
    assert_eq!(manager.active_messages(), 0);

    limiter.on_fill_tick(Instant::now() + Duration::from_millis(1_100));
    manager.on_data(frames::dubbo::oneway(4, "svc", "Put"), false);
    assert_eq!(pool.connections().len(), 3);
}

#[test]
fn condition_bucket_only_limits_matching_requests() {
    let (config, pool) = limited(
        r#"[
            {"name": "local_ratelimit", "config": {"conditions": [
                {"match": [{"key": "method", "value": "Hot"}],
                 "token_bucket": {"max_tokens": 1, "fill_interval_ms": 60000}}
            ]}},
            {"name": "router", "config": {}}
        ]"#,
    );
    let downstream = RecordingDownstream::default();
    let mut manager = ConnectionManager::with_seed(Arc::new(config), downstream.boxed(), 1);

    manager.on_data(frames::dubbo::oneway(1, "svc", "Hot"), false);
    manager.on_data(frames::dubbo::oneway(2, "svc", "Hot"), false);
    manager.on_data(frames::dubbo::oneway(3, "svc", "Cold"), false);
    manager.on_data(frames::dubbo::oneway(4, "svc", "Cold"), false);

    assert_eq!(pool.connections().len(), 3);
    let replies = downstream.responses(CodecKind::Dubbo);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].request_id(), 2);
    assert_eq!(manager.stats().local_response_error.value(), 1);
}
