#![deny(unsafe_code)]

//! Daemon error reporting.
//!
//! [`DaemonError`] pairs every failure of the entry points with the process
//! exit status the binary reports for it.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;

/// Process exit statuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean shutdown.
    Ok = 0,
    /// Invalid command line.
    Usage = 1,
    /// The configuration could not be loaded.
    Config = 2,
    /// The tracing subscriber could not be installed.
    Logging = 3,
    /// The listener socket failed.
    Socket = 10,
    /// The async runtime could not start.
    Runtime = 12,
}

impl ExitCode {
    /// Numeric status.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Error returned when the daemon cannot start or keep serving.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The route table or filter chain was rejected.
    #[error("invalid proxy configuration: {0}")]
    Proxy(#[from] proxy::ProxyError),
    /// Binding the listener failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested address.
        address: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Accepting connections failed.
    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),
    /// The runtime could not be built.
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] io::Error),
    /// Logging setup failed.
    #[error(transparent)]
    Logging(#[from] logging::InitError),
}

impl DaemonError {
    /// Typed exit status for the error.
    #[must_use]
    pub const fn code(&self) -> ExitCode {
        match self {
            Self::Config(_) | Self::Proxy(_) => ExitCode::Config,
            Self::Bind { .. } | Self::Accept(_) => ExitCode::Socket,
            Self::Runtime(_) => ExitCode::Runtime,
            Self::Logging(_) => ExitCode::Logging,
        }
    }

    /// Exit status as reported to the shell.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.code().as_i32()
    }
}
