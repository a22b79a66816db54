//! crates/proxy/src/message/mod.rs
//!
//! Per-request state owned by a connection manager.

use std::time::Instant;

use codec::{Metadata, Mutation};

use crate::filter::{DecoderFilter, EncoderFilter, FilterChainBuilder};
use crate::route::Route;

mod response;
mod slab;

pub(crate) use response::ResponseDecoder;
pub use slab::MessageHandle;
pub(crate) use slab::Slab;

/// Addresses one filter of one in-flight message.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FilterHandle {
    /// The message.
    pub message: MessageHandle,
    /// Position of the filter in its chain.
    pub index: usize,
}

/// A decoded request between decode and completion.
///
/// Filters are stored as `Option` so one can be taken out while it runs and
/// receives mutable access to the rest of the message.
pub(crate) struct ActiveMessage {
    pub(crate) stream_id: u64,
    pub(crate) metadata: Metadata,
    pub(crate) mutation: Mutation,
    pub(crate) decoder_filters: Vec<Option<Box<dyn DecoderFilter>>>,
    pub(crate) encoder_filters: Vec<Option<Box<dyn EncoderFilter>>>,
    pub(crate) response_decoder: Option<ResponseDecoder>,
    pub(crate) response: Option<(Metadata, Mutation)>,
    pub(crate) encoder_paused: bool,
    pub(crate) pending_stream_decoded: bool,
    pub(crate) local_response_sent: bool,
    pub(crate) reset_requested: bool,
    pub(crate) route: Option<Option<Route>>,
    pub(crate) started_at: Instant,
}

impl ActiveMessage {
    pub(crate) fn new(
        stream_id: u64,
        metadata: Metadata,
        mutation: Mutation,
        chain: FilterChainBuilder,
    ) -> Self {
        Self {
            stream_id,
            metadata,
            mutation,
            decoder_filters: chain.decoder_filters.into_iter().map(Some).collect(),
            encoder_filters: chain.encoder_filters.into_iter().map(Some).collect(),
            response_decoder: None,
            response: None,
            encoder_paused: false,
            pending_stream_decoded: false,
            local_response_sent: false,
            reset_requested: false,
            route: None,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn request_id(&self) -> u64 {
        self.metadata.request_id()
    }

    /// Calls `on_destroy` on every filter still attached.
    pub(crate) fn destroy_filters(&mut self) {
        for filter in self.decoder_filters.iter_mut().flatten() {
            filter.on_destroy();
        }
        for filter in self.encoder_filters.iter_mut().flatten() {
            filter.on_destroy();
        }
    }
}
