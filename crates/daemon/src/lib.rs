#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `daemon` puts the I/O-free [`proxy`] engine on the network. It loads a
//! JSON [`DaemonConfig`], binds a Tokio listener and drives one
//! [`proxy::ConnectionManager`] per accepted connection. Upstream hosts are
//! reached through pooled TCP connections; the binary entry point is [`run`].
//!
//! # Design
//!
//! - Each downstream connection is a single task. It owns the engine and
//!   `select!`s over socket reads, upstream completions, the idle deadline and
//!   the shutdown broadcast, so the engine is never shared between threads.
//! - Upstream completions travel over a bounded channel bound to the
//!   connection through [`ConnectionClusters`]; pools never call back into
//!   the engine directly. A full channel stops the upstream sockets from
//!   being read.
//! - Routes, clusters, rate limiters and stats are built once in
//!   [`Server::bind`] and shared by every connection.
//!
//! # Example
//!
//! ```no_run
//! use daemon::{DaemonConfig, Server};
//!
//! # async fn serve() -> Result<(), daemon::DaemonError> {
//! let config = DaemonConfig::load("meta-proxy.json".as_ref())?;
//! let server = Server::bind(&config).await?;
//! println!("listening on {}", server.local_addr().map_err(daemon::DaemonError::Accept)?);
//! server.serve().await
//! # }
//! ```

mod cli;
mod cluster;
mod config;
mod downstream;
mod error;
mod registry;
mod server;
mod upstream;

pub use crate::cli::{exit_code_from, run};
pub use crate::cluster::{Clusters, ConnectionClusters, EventSink, UPSTREAM_EVENT_CAPACITY};
pub use crate::config::{
    ClusterConfig, ConfigError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_LISTEN_ADDRESS,
    DEFAULT_MAX_DOWNSTREAM_CONNECTIONS, DEFAULT_MAX_UPSTREAM_CONNECTIONS, DaemonConfig,
    DaemonConfigBuilder, LbPolicy,
};
pub use crate::downstream::TcpDownstream;
pub use crate::error::{DaemonError, ExitCode};
pub use crate::registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use crate::server::{Server, ShutdownHandle};
pub use crate::upstream::{HostPool, HostStatsSnapshot, TcpPool, TcpUpstream};
