//! crates/proxy/src/stream.rs
//!
//! Long-lived duplex streams. A stream is opened when the upstream connection
//! for a stream initiation is ready and lives until both directions have
//! sent a close frame or the upstream connection goes away.

use bytes::BytesMut;
use codec::{Codec, MessageType, Metadata};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::message::ResponseDecoder;
use crate::stats::ProxyStats;
use crate::upstream::{CloseType, DownstreamConnection, UpstreamConnection, UpstreamTarget};

struct Stream {
    upstream: Box<dyn UpstreamConnection>,
    decoder: ResponseDecoder,
    client_closed: bool,
    server_closed: bool,
}

impl Stream {
    fn finished(&self) -> bool {
        self.client_closed && self.server_closed
    }
}

/// Closes the side(s) named by a stream frame. Returns `true` for a close frame.
fn apply_close(message_type: MessageType, this_side: &mut bool, other_side: &mut bool) -> bool {
    match message_type {
        MessageType::StreamCloseOneWay => {
            *this_side = true;
            true
        }
        MessageType::StreamCloseTwoWay => {
            *this_side = true;
            *other_side = true;
            true
        }
        _ => false,
    }
}

/// Streams of one downstream connection, by stream id.
#[derive(Default)]
pub(crate) struct StreamMap {
    streams: FxHashMap<u64, Stream>,
}

impl StreamMap {
    /// Opens stream `id` over `upstream`. Upstream bytes for it arrive as
    /// [`UpstreamTarget::Stream`] events.
    pub(crate) fn open(
        &mut self,
        id: u64,
        mut upstream: Box<dyn UpstreamConnection>,
        codec: Box<dyn Codec>,
    ) {
        debug!(target: "meta_proxy::stream", stream_id = id, upstream = %upstream.remote_address(), "stream opened");
        upstream.add_upstream_callbacks(UpstreamTarget::Stream(id));
        let previous = self.streams.insert(
            id,
            Stream {
                upstream,
                decoder: ResponseDecoder::new(codec),
                client_closed: false,
                server_closed: false,
            },
        );
        if previous.is_some() {
            warn!(target: "meta_proxy::stream", stream_id = id, "stream id reused, previous stream dropped");
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.streams.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    /// Forwards a client frame upstream.
    pub(crate) fn on_client_frame(&mut self, mut metadata: Metadata) {
        let id = metadata.stream_id();
        let Some(stream) = self.streams.get_mut(&id) else {
            warn!(
                target: "meta_proxy::stream",
                stream_id = id,
                message_type = metadata.message_type().as_str(),
                "no stream for frame, dropping"
            );
            return;
        };
        let message_type = metadata.message_type();
        stream.upstream.write(metadata.take_origin_message(), false);
        if apply_close(
            message_type,
            &mut stream.client_closed,
            &mut stream.server_closed,
        ) {
            debug!(target: "meta_proxy::stream", stream_id = id, message_type = message_type.as_str(), "client closed stream");
        }
        self.remove_if_finished(id);
    }

    /// Decodes server frames and relays them downstream.
    pub(crate) fn on_upstream_data(
        &mut self,
        id: u64,
        data: &mut BytesMut,
        downstream: &mut dyn DownstreamConnection,
        stats: &ProxyStats,
    ) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let frames = match stream.decoder.decode_all(data) {
            Ok(frames) => frames,
            Err(error) => {
                warn!(target: "meta_proxy::stream", stream_id = id, %error, "undecodable server frame, closing stream");
                stats.response_decoding_error.inc();
                stream.upstream.close(CloseType::NoFlush);
                self.streams.remove(&id);
                return;
            }
        };
        for mut frame in frames {
            let message_type = frame.message_type();
            if downstream.is_open() {
                downstream.write(frame.take_origin_message(), false);
            }
            apply_close(
                message_type,
                &mut stream.server_closed,
                &mut stream.client_closed,
            );
        }
        self.remove_if_finished(id);
    }

    /// Forgets a stream whose upstream connection closed.
    pub(crate) fn on_upstream_close(&mut self, id: u64) {
        if self.streams.remove(&id).is_some() {
            debug!(target: "meta_proxy::stream", stream_id = id, "upstream closed stream");
        }
    }

    /// Closes every stream's upstream connection.
    pub(crate) fn close_all(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            stream.upstream.close(CloseType::NoFlush);
        }
    }

    fn remove_if_finished(&mut self, id: u64) {
        if self.streams.get(&id).is_some_and(Stream::finished) {
            debug!(target: "meta_proxy::stream", stream_id = id, "stream finished");
            self.streams.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_way_close_closes_both_sides() {
        let (mut client, mut server) = (false, false);
        assert!(apply_close(
            MessageType::StreamCloseTwoWay,
            &mut client,
            &mut server
        ));
        assert!(client && server);
    }

    #[test]
    fn one_way_close_closes_own_side() {
        let (mut client, mut server) = (false, false);
        assert!(apply_close(
            MessageType::StreamCloseOneWay,
            &mut client,
            &mut server
        ));
        assert!(client && !server);
        assert!(!apply_close(MessageType::StreamData, &mut client, &mut server));
    }
}
