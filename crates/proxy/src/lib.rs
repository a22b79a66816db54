#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `proxy` is the protocol-agnostic core of the meta protocol proxy. A
//! [`ConnectionManager`] decodes requests from one downstream connection with
//! the listener's [`codec::Codec`], runs each through a chain of decoder
//! filters ending in the [`Router`], and relays upstream responses back
//! through the encoder filters.
//!
//! # Design
//!
//! - The engine does no I/O. Bytes, connection events and upstream
//!   completions are pushed in by a runtime; writes go out through the
//!   [`DownstreamConnection`] and [`UpstreamConnection`] traits.
//! - Asynchronous completions are addressed by [`UpstreamTarget`] and fed back
//!   with [`ConnectionManager::on_upstream_event`], so filters never hold
//!   references into the manager between events.
//! - In-flight messages live in a generation-checked slab. Deleting a message
//!   marks it; the slot is freed when the current entry point returns.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use codec::CodecKind;
//! use proxy::ProxyConfig;
//!
//! let config = Arc::new(ProxyConfig::builder(CodecKind::Dubbo).build());
//! assert!(config.filters().is_empty());
//! ```

mod config;
mod conn_manager;
mod decoder;
mod error;
mod filter;
mod message;
mod rate_limit;
mod reply;
/// Route tables and their configuration.
pub mod route;
mod router;
mod stats;
mod stream;
mod upstream;

pub use crate::config::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_STAT_PREFIX, FilterConfig, ProxyConfig, ProxyConfigBuilder,
    RouterConfig,
};
pub use crate::conn_manager::ConnectionManager;
pub use crate::decoder::{Decoder, DecoderDelegate, ProtocolState};
pub use crate::error::ProxyError;
pub use crate::filter::{
    DecoderFilter, DecoderFilterCallbacks, EncoderFilter, EncoderFilterCallbacks,
    FilterChainBuilder, FilterEvent, FilterFactory, FilterIterationStartState, FilterStatus,
    UpstreamResponseStatus,
};
pub use crate::message::{FilterHandle, MessageHandle};
pub use crate::rate_limit::{LocalRateLimitFactory, LocalRateLimitFilter};
pub use crate::reply::{AppException, DirectResponse, HeartbeatResponse, ResponseType};
pub use crate::route::{Route, RouteTable};
pub use crate::router::{Router, RouterFactory};
pub use crate::stats::{Counter, Gauge, ProxyStats, ProxyStatsSnapshot};
pub use crate::upstream::{
    CloseType, ClusterInfo, ClusterManager, ConnectionEvent, ConnectionPool, DownstreamConnection,
    HandlerDelivery, LoadBalancerContext, OutlierResult, PendingConnection, PoolFailureReason,
    PoolRequest, UpstreamConnection, UpstreamEvent, UpstreamHandler, UpstreamHandlerManager,
    UpstreamTarget,
};
