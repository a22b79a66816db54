use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use codec::{CodecKind, MessageFramer, MessageType, Metadata, ResponseStatus, frames};
use daemon::{ClusterConfig, DaemonConfig, Server, ShutdownHandle};
use futures::StreamExt;
use proxy::route::RouteConfig;
use proxy::{FilterConfig, RouterConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

const WAIT: Duration = Duration::from_secs(5);

/// Dubbo server answering every two-way request with `pong`.
struct FakeUpstream {
    address: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl FakeUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(answer(socket));
            }
        });
        Self { address, accepted }
    }

    fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn answer(socket: TcpStream) {
    let (reader, mut writer) = socket.into_split();
    let mut requests = FramedRead::new(
        reader,
        MessageFramer::new(CodecKind::Dubbo.new_codec(), MessageType::Request),
    );
    while let Some(Ok(request)) = requests.next().await {
        if request.message_type() == MessageType::Request {
            let response = frames::dubbo::response(request.request_id(), b"pong");
            if writer.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

struct Proxy {
    address: SocketAddr,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), daemon::DaemonError>>,
    stats: Arc<proxy::ProxyStats>,
}

impl Proxy {
    async fn start(config: DaemonConfig) -> Self {
        let server = Server::bind(&config).await.unwrap();
        let address = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let stats = server.stats();
        let task = tokio::spawn(server.serve());
        Self {
            address,
            shutdown,
            task,
            stats,
        }
    }

    async fn client(&self) -> Client {
        let stream = TcpStream::connect(self.address).await.unwrap();
        let (reader, writer) = stream.into_split();
        Client {
            writer,
            responses: FramedRead::new(
                reader,
                MessageFramer::new(CodecKind::Dubbo.new_codec(), MessageType::Response),
            ),
        }
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server stops")
            .unwrap()
            .unwrap();
    }
}

struct Client {
    writer: tokio::net::tcp::OwnedWriteHalf,
    responses: FramedRead<OwnedReadHalf, MessageFramer>,
}

impl Client {
    async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn receive(&mut self) -> Metadata {
        tokio::time::timeout(WAIT, self.responses.next())
            .await
            .expect("response within timeout")
            .expect("connection open")
            .expect("decodable response")
    }

    async fn expect_eof(self) {
        let mut reader = self.responses.into_inner();
        let mut rest = Vec::new();
        let read = tokio::time::timeout(WAIT, reader.read_to_end(&mut rest))
            .await
            .expect("connection closes");
        assert!(read.is_ok() || rest.is_empty());
    }
}

fn routes(json: &str) -> RouteConfig {
    serde_json::from_str(json).unwrap()
}

fn config(upstream: SocketAddr, multiplexing: bool) -> DaemonConfig {
    DaemonConfig::builder(CodecKind::Dubbo)
        .address("127.0.0.1:0".parse().unwrap())
        .routes(routes(
            r#"{"routes": [
                {"match": [{"name": "method", "exact_match": "Lost"}], "cluster": "nowhere"},
                {"cluster": "echo"}
            ]}"#,
        ))
        .filter(FilterConfig::Router(RouterConfig { multiplexing }))
        .cluster(ClusterConfig::new("echo", &[upstream]))
        .build()
        .unwrap()
}

#[tokio::test]
async fn request_is_relayed_to_the_upstream_and_back() {
    let upstream = FakeUpstream::start().await;
    let proxy = Proxy::start(config(upstream.address, false)).await;
    let mut client = proxy.client().await;

    client.send(&frames::dubbo::request(7, "svc", "Get")).await;
    let response = client.receive().await;
    assert_eq!(response.request_id(), 7);
    assert_eq!(response.response_status(), ResponseStatus::Ok);
    assert_eq!(proxy.stats.request.value(), 1);

    client.send(&frames::dubbo::request(8, "svc", "Get")).await;
    assert_eq!(client.receive().await.request_id(), 8);
    assert_eq!(upstream.connections(), 1, "pooled connection is reused");

    proxy.stop().await;
}

#[tokio::test]
async fn heartbeat_is_answered_by_the_proxy() {
    let upstream = FakeUpstream::start().await;
    let proxy = Proxy::start(config(upstream.address, false)).await;
    let mut client = proxy.client().await;

    client.send(&frames::dubbo::heartbeat(3)).await;
    let reply = client.receive().await;
    assert_eq!(reply.request_id(), 3);
    assert_eq!(reply.message_type(), MessageType::Heartbeat);
    assert_eq!(upstream.connections(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn unknown_cluster_gets_an_error_reply() {
    let upstream = FakeUpstream::start().await;
    let proxy = Proxy::start(config(upstream.address, false)).await;
    let mut client = proxy.client().await;

    client.send(&frames::dubbo::request(11, "svc", "Lost")).await;
    let reply = client.receive().await;
    assert_eq!(reply.request_id(), 11);
    assert_eq!(reply.response_status(), ResponseStatus::Error);
    assert_eq!(upstream.connections(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_gets_an_error_reply() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = Proxy::start(config(closed, false)).await;
    let mut client = proxy.client().await;

    client.send(&frames::dubbo::request(5, "svc", "Get")).await;
    let reply = client.receive().await;
    assert_eq!(reply.request_id(), 5);
    assert_eq!(reply.response_status(), ResponseStatus::Error);

    proxy.stop().await;
}

#[tokio::test]
async fn multiplexed_requests_share_one_upstream_connection() {
    let upstream = FakeUpstream::start().await;
    let proxy = Proxy::start(config(upstream.address, true)).await;
    let mut client = proxy.client().await;

    let mut batch = frames::dubbo::request(1, "svc", "A");
    batch.unsplit(frames::dubbo::request(2, "svc", "B"));
    batch.unsplit(frames::dubbo::request(3, "svc", "C"));
    client.send(&batch).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(client.receive().await.request_id());
    }
    ids.sort_unstable();
    assert_eq!(ids, [1, 2, 3]);
    assert_eq!(upstream.connections(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let upstream = FakeUpstream::start().await;
    let proxy = Proxy::start(config(upstream.address, false)).await;
    let mut client = proxy.client().await;
    client.send(&frames::dubbo::request(1, "svc", "Get")).await;
    client.receive().await;

    proxy.stop().await;
    client.expect_eof().await;
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let upstream = FakeUpstream::start().await;
    let config = DaemonConfig::builder(CodecKind::Dubbo)
        .address("127.0.0.1:0".parse().unwrap())
        .idle_timeout(Duration::from_millis(100))
        .routes(routes(r#"{"routes": [{"cluster": "echo"}]}"#))
        .filter(FilterConfig::Router(RouterConfig::default()))
        .cluster(ClusterConfig::new("echo", &[upstream.address]))
        .build()
        .unwrap();
    let proxy = Proxy::start(config).await;
    let client = proxy.client().await;

    client.expect_eof().await;
    assert_eq!(proxy.stats.idle_timeout.value(), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn client_half_close_finishes_the_connection() {
    let upstream = FakeUpstream::start().await;
    let proxy = Proxy::start(config(upstream.address, false)).await;
    let mut client = proxy.client().await;
    client.send(&frames::dubbo::request(1, "svc", "Get")).await;
    client.receive().await;

    client.writer.shutdown().await.unwrap();
    client.expect_eof().await;
    proxy.stop().await;
}
