//! Client side of a proxied connection.
//!
//! The engine writes synchronously; [`TcpDownstream`] queues the bytes for a
//! writer task that owns the socket's write half.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use proxy::{CloseType, DownstreamConnection};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const LOG_TARGET: &str = "meta_proxy::downstream";

#[derive(Debug)]
enum Write {
    Data(BytesMut, bool),
    Close(CloseType),
}

/// [`DownstreamConnection`] over the write half of an accepted socket.
#[derive(Debug)]
pub struct TcpDownstream {
    writes: mpsc::UnboundedSender<Write>,
    discard: Arc<AtomicBool>,
    peer: SocketAddr,
    open: bool,
}

impl TcpDownstream {
    /// Starts the writer task for `writer` and returns the handle the engine
    /// writes through, plus the task so the caller can wait for the flush.
    pub fn spawn(writer: OwnedWriteHalf, peer: SocketAddr) -> (Self, JoinHandle<()>) {
        let (writes, receiver) = mpsc::unbounded_channel();
        let discard = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(write_loop(writer, receiver, Arc::clone(&discard), peer));
        (
            Self {
                writes,
                discard,
                peer,
                open: true,
            },
            task,
        )
    }
}

impl DownstreamConnection for TcpDownstream {
    fn write(&mut self, data: BytesMut, end_stream: bool) {
        if !self.open {
            trace!(target: LOG_TARGET, peer = %self.peer, "write after close dropped");
            return;
        }
        if self.writes.send(Write::Data(data, end_stream)).is_err() {
            self.open = false;
        }
    }

    fn close(&mut self, close_type: CloseType) {
        if !self.open {
            return;
        }
        self.open = false;
        if close_type == CloseType::NoFlush {
            self.discard.store(true, Ordering::Release);
        }
        let _ = self.writes.send(Write::Close(close_type));
    }

    fn is_open(&self) -> bool {
        self.open && !self.writes.is_closed()
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut writes: mpsc::UnboundedReceiver<Write>,
    discard: Arc<AtomicBool>,
    peer: SocketAddr,
) {
    while let Some(write) = writes.recv().await {
        if discard.load(Ordering::Acquire) {
            break;
        }
        match write {
            Write::Data(data, end_stream) => {
                if let Err(error) = writer.write_all(&data).await {
                    debug!(target: LOG_TARGET, %peer, %error, "downstream write failed");
                    break;
                }
                if end_stream {
                    let _ = writer.shutdown().await;
                }
            }
            Write::Close(_) => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    trace!(target: LOG_TARGET, %peer, "downstream writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpDownstream, JoinHandle<()>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let (downstream, task) = TcpDownstream::spawn(write, peer);
        (downstream, task, client)
    }

    #[tokio::test]
    async fn flush_close_delivers_queued_writes() {
        let (mut downstream, task, mut client) = pair().await;
        downstream.write(BytesMut::from(&b"hello "[..]), false);
        downstream.write(BytesMut::from(&b"world"[..]), false);
        downstream.close(CloseType::FlushWrite);
        assert!(!downstream.is_open());
        task.await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn no_flush_close_discards_queued_writes() {
        let (mut downstream, task, mut client) = pair().await;
        downstream.close(CloseType::NoFlush);
        downstream.write(BytesMut::from(&b"late"[..]), false);
        task.await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn reports_peer_address() {
        let (downstream, _task, client) = pair().await;
        assert_eq!(
            downstream.peer_address(),
            Some(client.local_addr().unwrap())
        );
    }
}
