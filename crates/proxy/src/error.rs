use codec::ProtocolError;
use ratelimit::RateLimitError;
use thiserror::Error;

/// Failure raised while building or running the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A codec rejected bytes or could not encode a message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A route header matcher carried a regular expression that does not compile.
    #[error("route {route}: invalid regex for header '{header}': {source}")]
    InvalidRegex {
        /// Position of the offending route in the table.
        route: usize,
        /// Header the matcher applies to.
        header: String,
        /// Compilation failure reported by the regex engine.
        #[source]
        source: regex::Error,
    },

    /// A route entry is structurally invalid.
    #[error("route {route}: {reason}")]
    InvalidRoute {
        /// Position of the offending route in the table.
        route: usize,
        /// Why the route was rejected.
        reason: &'static str,
    },

    /// A local rate limit filter was configured with an invalid bucket.
    #[error("local rate limit: {0}")]
    RateLimit(#[from] RateLimitError),
}
