use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use codec::{CodecKind, DecodeStatus, MessageType, Metadata, Mutation, frames};

use super::ConnectionManager;
use crate::config::ProxyConfig;
use crate::filter::{
    DecoderFilter, DecoderFilterCallbacks, EncoderFilter, EncoderFilterCallbacks,
    FilterChainBuilder, FilterEvent, FilterFactory, FilterStatus, UpstreamResponseStatus,
};
use crate::message::FilterHandle;
use crate::upstream::{
    CloseType, ConnectionEvent, DownstreamConnection, UpstreamEvent, UpstreamTarget,
};

#[derive(Default)]
struct Wire {
    writes: Vec<BytesMut>,
    closes: Vec<CloseType>,
}

#[derive(Clone, Default)]
struct Downstream(Arc<Mutex<Wire>>);

impl DownstreamConnection for Downstream {
    fn write(&mut self, data: BytesMut, _end_stream: bool) {
        self.0.lock().unwrap().writes.push(data);
    }

    fn close(&mut self, close_type: CloseType) {
        self.0.lock().unwrap().closes.push(close_type);
    }

    fn is_open(&self) -> bool {
        self.0.lock().unwrap().closes.is_empty()
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        None
    }
}

type Log = Arc<Mutex<Vec<&'static str>>>;

/// Records its name; pauses on its first call when `pause` is set and resumes
/// on any event.
struct Step {
    name: &'static str,
    pause: bool,
    consume: bool,
    calls: usize,
    log: Log,
    targets: Arc<Mutex<Vec<FilterHandle>>>,
}

impl DecoderFilter for Step {
    fn on_message_decoded(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) -> FilterStatus {
        self.log.lock().unwrap().push(self.name);
        self.calls += 1;
        if self.pause && self.calls == 1 {
            if self.consume {
                callbacks.metadata_mut().take_origin_message();
            }
            self.targets.lock().unwrap().push(callbacks.target());
            return FilterStatus::PauseIteration;
        }
        FilterStatus::ContinueIteration
    }

    fn on_event(&mut self, _event: FilterEvent, callbacks: &mut dyn DecoderFilterCallbacks) {
        callbacks.continue_decoding();
    }
}

struct Steps {
    consume: bool,
    log: Log,
    targets: Arc<Mutex<Vec<FilterHandle>>>,
}

impl FilterFactory for Steps {
    fn name(&self) -> &'static str {
        "steps"
    }

    fn create_filters(&self, chain: &mut FilterChainBuilder) {
        for (name, pause) in [("a", false), ("b", true), ("c", false)] {
            chain.add_decoder_filter(Box::new(Step {
                name,
                pause,
                consume: self.consume,
                calls: 0,
                log: Arc::clone(&self.log),
                targets: Arc::clone(&self.targets),
            }));
        }
    }
}

fn manager_with(
    factory: Option<Arc<dyn FilterFactory>>,
    idle: Option<Duration>,
) -> (ConnectionManager, Downstream) {
    manager_for(CodecKind::Dubbo, factory, idle)
}

fn manager_for(
    kind: CodecKind,
    factory: Option<Arc<dyn FilterFactory>>,
    idle: Option<Duration>,
) -> (ConnectionManager, Downstream) {
    let mut builder = ProxyConfig::builder(kind).idle_timeout(idle);
    if let Some(factory) = factory {
        builder = builder.filter(factory);
    }
    let downstream = Downstream::default();
    let manager = ConnectionManager::with_seed(
        Arc::new(builder.build()),
        Box::new(downstream.clone()),
        7,
    );
    (manager, downstream)
}

fn resume(manager: &mut ConnectionManager, target: FilterHandle) {
    manager.on_upstream_event(
        UpstreamTarget::Filter(target),
        UpstreamEvent::Connection(ConnectionEvent::Connected),
    );
}

fn run_pause_resume(consume: bool) -> Vec<&'static str> {
    let log = Log::default();
    let targets = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(Steps {
        consume,
        log: Arc::clone(&log),
        targets: Arc::clone(&targets),
    });
    let (mut manager, _) = manager_with(Some(factory), None);

    manager.on_data(frames::dubbo::request(1, "svc", "m"), false);
    assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    assert!(manager.is_stopped());

    let target = targets.lock().unwrap()[0];
    resume(&mut manager, target);
    assert!(!manager.is_stopped());
    assert_eq!(manager.stats().request.value(), 1);
    assert_eq!(manager.stats().request_twoway.value(), 1);
    let log = log.lock().unwrap().clone();
    log
}

#[test]
fn resume_restarts_at_paused_filter_when_message_unconsumed() {
    assert_eq!(run_pause_resume(false), ["a", "b", "b", "c"]);
}

#[test]
fn resume_starts_after_paused_filter_when_message_consumed() {
    assert_eq!(run_pause_resume(true), ["a", "b", "c"]);
}

#[test]
fn paused_filter_holds_back_later_requests() {
    let log = Log::default();
    let targets = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(Steps {
        consume: true,
        log: Arc::clone(&log),
        targets: Arc::clone(&targets),
    });
    let (mut manager, _) = manager_with(Some(factory), None);

    let mut bytes = frames::dubbo::request(1, "svc", "m");
    bytes.unsplit(frames::dubbo::request(2, "svc", "m"));
    manager.on_data(bytes, false);
    assert_eq!(manager.stats().request_decoding_success.value(), 1);

    let first = targets.lock().unwrap()[0];
    resume(&mut manager, first);
    assert_eq!(manager.stats().request_decoding_success.value(), 2);
    assert!(manager.is_stopped(), "second request pauses in its own chain");
    assert_eq!(manager.active_messages(), 2);
}

#[test]
fn one_way_without_filters_finishes_immediately() {
    let (mut manager, _) = manager_with(None, None);
    manager.on_data(frames::dubbo::oneway(3, "svc", "m"), false);
    assert_eq!(manager.active_messages(), 0);
    assert_eq!(manager.stats().request_oneway.value(), 1);
    assert_eq!(manager.stats().request_active.value(), 0);
}

#[test]
fn heartbeat_is_answered_without_filters() {
    let log = Log::default();
    let factory = Arc::new(Steps {
        consume: false,
        log: Arc::clone(&log),
        targets: Arc::default(),
    });
    let (mut manager, downstream) = manager_with(Some(factory), None);
    manager.on_data(frames::dubbo::heartbeat(11), false);

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(manager.stats().request_event.value(), 1);
    let mut reply = downstream.0.lock().unwrap().writes.remove(0);
    let mut codec = CodecKind::Dubbo.new_codec();
    let mut metadata = Metadata::new(MessageType::Response);
    assert_eq!(
        codec.decode(&mut reply, &mut metadata).unwrap(),
        DecodeStatus::Done
    );
    assert_eq!(metadata.message_type(), MessageType::Heartbeat);
    assert_eq!(metadata.request_id(), 11);
}

#[test]
fn garbage_closes_without_flush() {
    let (mut manager, downstream) = manager_with(None, None);
    manager.on_data(BytesMut::from(&[0u8; 32][..]), false);
    assert_eq!(manager.stats().request_decoding_error.value(), 1);
    assert_eq!(downstream.0.lock().unwrap().closes, [CloseType::NoFlush]);
    assert!(downstream.0.lock().unwrap().writes.is_empty());
    assert!(manager.is_closed());

    manager.on_data(frames::dubbo::request(1, "svc", "m"), false);
    assert_eq!(manager.stats().request_decoding_success.value(), 0);
}

#[test]
fn idle_timeout_resets_and_closes_once() {
    let targets = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(Steps {
        consume: true,
        log: Log::default(),
        targets: Arc::clone(&targets),
    });
    let (mut manager, downstream) = manager_with(Some(factory), Some(Duration::from_secs(5)));
    assert!(manager.idle_deadline().is_some());
    manager.on_data(frames::dubbo::request(1, "svc", "m"), false);
    assert_eq!(manager.active_messages(), 1);

    manager.on_idle_timeout();
    manager.on_idle_timeout();
    assert_eq!(manager.stats().idle_timeout.value(), 1);
    assert_eq!(manager.stats().cx_destroy_local_with_active_rq.value(), 1);
    assert_eq!(downstream.0.lock().unwrap().closes.len(), 1);
    assert_eq!(manager.active_messages(), 0);
    assert_eq!(manager.stats().request_active.value(), 0);
    assert!(manager.idle_deadline().is_none());
}

#[test]
fn half_close_behind_two_way_request_closes_immediately() {
    let factory = Arc::new(Steps {
        consume: true,
        log: Log::default(),
        targets: Arc::default(),
    });
    let (mut manager, downstream) = manager_with(Some(factory), None);
    manager.on_data(frames::dubbo::request(1, "svc", "m"), true);
    assert_eq!(downstream.0.lock().unwrap().closes, [CloseType::FlushWrite]);
    assert_eq!(manager.stats().cx_destroy_remote_with_active_rq.value(), 1);
}

#[test]
fn half_close_waits_for_paused_one_way_request() {
    let targets = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(Steps {
        consume: true,
        log: Log::default(),
        targets: Arc::clone(&targets),
    });
    let (mut manager, downstream) = manager_with(Some(factory), None);
    manager.on_data(frames::dubbo::oneway(1, "svc", "m"), true);
    assert!(downstream.0.lock().unwrap().closes.is_empty());

    let target = targets.lock().unwrap()[0];
    resume(&mut manager, target);
    assert_eq!(manager.stats().request_oneway.value(), 1);
    assert_eq!(downstream.0.lock().unwrap().closes, [CloseType::FlushWrite]);
    assert_eq!(manager.stats().cx_destroy_remote_with_active_rq.value(), 0);
}

#[test]
fn remote_close_counts_active_requests() {
    let factory = Arc::new(Steps {
        consume: true,
        log: Log::default(),
        targets: Arc::default(),
    });
    let (mut manager, _) = manager_with(Some(factory), None);
    manager.on_data(frames::dubbo::request(1, "svc", "m"), false);
    manager.on_event(ConnectionEvent::RemoteClose);
    manager.on_event(ConnectionEvent::RemoteClose);
    assert_eq!(manager.stats().cx_destroy_remote_with_active_rq.value(), 1);
    assert_eq!(manager.active_messages(), 0);
}

/// Hands a canned upstream response to the message as soon as it is decoded.
struct Respond {
    response: BytesMut,
    statuses: Arc<Mutex<Vec<UpstreamResponseStatus>>>,
}

impl DecoderFilter for Respond {
    fn on_message_decoded(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) -> FilterStatus {
        callbacks.start_upstream_response();
        let status = callbacks.upstream_data(&mut self.response);
        self.statuses.lock().unwrap().push(status);
        FilterStatus::ContinueIteration
    }
}

/// Encoder filter returning `first` on its first call and continuing after.
struct Stage {
    name: &'static str,
    first: FilterStatus,
    consume: bool,
    header: Option<(&'static str, &'static str)>,
    calls: usize,
    log: Log,
    targets: Arc<Mutex<Vec<FilterHandle>>>,
}

impl EncoderFilter for Stage {
    fn on_message_encoded(
        &mut self,
        metadata: &mut Metadata,
        mutation: &mut Mutation,
        callbacks: &mut dyn EncoderFilterCallbacks,
    ) -> FilterStatus {
        self.log.lock().unwrap().push(self.name);
        self.calls += 1;
        if let Some((key, value)) = self.header {
            mutation.put_string(key, value);
        }
        if self.calls > 1 || self.first == FilterStatus::ContinueIteration {
            return FilterStatus::ContinueIteration;
        }
        if self.consume {
            metadata.take_origin_message();
        }
        self.targets.lock().unwrap().push(callbacks.target());
        self.first
    }
}

#[derive(Default)]
struct Encoders {
    response: BytesMut,
    stages: Vec<(&'static str, FilterStatus)>,
    consume: bool,
    header: Option<(&'static str, &'static str)>,
    log: Log,
    targets: Arc<Mutex<Vec<FilterHandle>>>,
    statuses: Arc<Mutex<Vec<UpstreamResponseStatus>>>,
}

impl Encoders {
    fn new(response: BytesMut, stages: &[(&'static str, FilterStatus)]) -> Self {
        Self {
            response,
            stages: stages.to_vec(),
            ..Self::default()
        }
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    fn paused_at(&self) -> FilterHandle {
        self.targets.lock().unwrap()[0]
    }
}

impl FilterFactory for Encoders {
    fn name(&self) -> &'static str {
        "encoders"
    }

    fn create_filters(&self, chain: &mut FilterChainBuilder) {
        chain.add_decoder_filter(Box::new(Respond {
            response: self.response.clone(),
            statuses: Arc::clone(&self.statuses),
        }));
        for &(name, first) in &self.stages {
            chain.add_encoder_filter(Box::new(Stage {
                name,
                first,
                consume: self.consume,
                header: self.header,
                calls: 0,
                log: Arc::clone(&self.log),
                targets: Arc::clone(&self.targets),
            }));
        }
    }
}

const PAUSE_IN_MIDDLE: [(&str, FilterStatus); 3] = [
    ("e1", FilterStatus::ContinueIteration),
    ("e2", FilterStatus::PauseIteration),
    ("e3", FilterStatus::ContinueIteration),
];

fn with_encoders(factory: &Arc<Encoders>) -> (ConnectionManager, Downstream) {
    let shared = Arc::<Encoders>::clone(factory);
    manager_with(Some(shared), None)
}

fn decode_response(kind: CodecKind, mut bytes: BytesMut) -> Metadata {
    let mut codec = kind.new_codec();
    let mut metadata = Metadata::new(MessageType::Response);
    assert_eq!(
        codec.decode(&mut bytes, &mut metadata).unwrap(),
        DecodeStatus::Done
    );
    metadata
}

#[test]
fn encoder_pause_holds_response_until_continued() {
    let factory = Arc::new(Encoders::new(
        frames::dubbo::response(1, b"pong"),
        &PAUSE_IN_MIDDLE,
    ));
    let (mut manager, downstream) = with_encoders(&factory);

    manager.on_data(frames::dubbo::request(1, "svc", "m"), false);
    assert_eq!(factory.log(), ["e1", "e2"]);
    assert_eq!(
        *factory.statuses.lock().unwrap(),
        [UpstreamResponseStatus::Complete]
    );
    assert!(downstream.0.lock().unwrap().writes.is_empty());
    assert_eq!(manager.active_messages(), 1, "held response keeps the message");
    assert!(!manager.is_stopped(), "decoding is not blocked by the encoder");

    manager.continue_encoding(factory.paused_at());
    assert_eq!(factory.log(), ["e1", "e2", "e2", "e3"]);
    let writes = downstream.0.lock().unwrap().writes.clone();
    assert_eq!(writes.len(), 1);
    assert_eq!(decode_response(CodecKind::Dubbo, writes[0].clone()).request_id(), 1);
    assert_eq!(manager.stats().response.value(), 1);
    assert_eq!(manager.active_messages(), 0);

    manager.continue_encoding(factory.paused_at());
    assert_eq!(factory.log().len(), 4);
    assert_eq!(downstream.0.lock().unwrap().writes.len(), 1);
}

#[test]
fn encoder_resumes_after_filter_that_consumed_the_response() {
    let mut encoders = Encoders::new(frames::dubbo::response(2, b"pong"), &PAUSE_IN_MIDDLE);
    encoders.consume = true;
    let factory = Arc::new(encoders);
    let (mut manager, _) = with_encoders(&factory);

    manager.on_data(frames::dubbo::request(2, "svc", "m"), false);
    manager.continue_encoding(factory.paused_at());
    assert_eq!(factory.log(), ["e1", "e2", "e3"]);
    assert_eq!(manager.active_messages(), 0);
}

#[test]
fn encoder_abort_drops_response_and_frees_message() {
    let factory = Arc::new(Encoders::new(
        frames::dubbo::response(3, b"pong"),
        &[
            ("e1", FilterStatus::ContinueIteration),
            ("e2", FilterStatus::AbortIteration),
            ("e3", FilterStatus::ContinueIteration),
        ],
    ));
    let (mut manager, downstream) = with_encoders(&factory);

    manager.on_data(frames::dubbo::request(3, "svc", "m"), false);
    assert_eq!(factory.log(), ["e1", "e2"]);
    assert!(downstream.0.lock().unwrap().writes.is_empty());
    assert_eq!(manager.stats().response.value(), 0);
    assert_eq!(manager.active_messages(), 0);
}

#[test]
fn encoder_retry_is_reported_to_the_decoder_side() {
    let factory = Arc::new(Encoders::new(
        frames::dubbo::response(4, b"pong"),
        &[("e1", FilterStatus::Retry), ("e2", FilterStatus::ContinueIteration)],
    ));
    let (mut manager, downstream) = with_encoders(&factory);

    manager.on_data(frames::dubbo::request(4, "svc", "m"), false);
    assert_eq!(factory.log(), ["e1"]);
    assert_eq!(
        *factory.statuses.lock().unwrap(),
        [UpstreamResponseStatus::Retry]
    );
    assert!(downstream.0.lock().unwrap().writes.is_empty());
    assert_eq!(manager.active_messages(), 1, "the request is left for the router");
}

#[test]
fn encoder_mutation_is_written_into_the_response() {
    let mut encoders = Encoders::new(
        frames::trpc::unary_response(5, 0, b"ok"),
        &[("e1", FilterStatus::ContinueIteration)],
    );
    encoders.header = Some(("x-served-by", "edge-1"));
    let factory = Arc::new(encoders);
    let (mut manager, downstream) = manager_for(CodecKind::Trpc, Some(factory), None);

    manager.on_data(frames::trpc::unary_request(5, "svc", "fn", b"hi"), false);
    let writes = downstream.0.lock().unwrap().writes.clone();
    assert_eq!(writes.len(), 1);
    let response = decode_response(CodecKind::Trpc, writes[0].clone());
    assert_eq!(response.request_id(), 5);
    assert_eq!(response.get_string("x-served-by"), Some("edge-1"));
    assert!(response.origin_message().ends_with(b"ok"));
    assert_eq!(manager.active_messages(), 0);
}
