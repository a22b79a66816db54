#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `logging` owns the process-wide [`tracing`] subscriber for the proxy. Every
//! other crate only emits events through the `tracing` macros, using targets
//! under the `meta_proxy::` namespace (`meta_proxy::decoder`,
//! `meta_proxy::router`, ...), and never installs a subscriber itself.
//!
//! # Design
//!
//! A [`LogConfig`] describes the default level, the output [`LogFormat`] and
//! whether ANSI colours are used. [`init_tracing`] turns it into an
//! [`EnvFilter`](tracing_subscriber::EnvFilter) plus a `fmt` layer on top of
//! the registry. When `RUST_LOG` is set it replaces the configured level so
//! operators can raise verbosity for a single component without touching the
//! configuration file.
//!
//! # Examples
//!
//! ```
//! use logging::{LogConfig, LogFormat, LogLevel};
//!
//! let config = LogConfig::default()
//!     .with_level(LogLevel::Debug)
//!     .with_format(LogFormat::Compact)
//!     .with_ansi(false);
//! assert_eq!(config.level().as_directive(), "debug");
//! assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
//! ```

mod config;
mod init;

pub use config::{
    DEFAULT_ANSI, DEFAULT_FORMAT, DEFAULT_LEVEL, LogConfig, LogFormat, LogLevel, ParseLogError,
};
pub use init::{InitError, build_filter, init_tracing};
