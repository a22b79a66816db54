use std::time::Duration;

use thiserror::Error;

/// Configuration errors raised while building a [`crate::LocalRateLimiter`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// A bucket refills faster than the fill tick can be driven.
    #[error("local rate limit token bucket fill interval must be >= {min:?}, got {actual:?}")]
    FillIntervalTooShort {
        /// Smallest accepted interval.
        min: Duration,
        /// Interval found in the configuration.
        actual: Duration,
    },
    /// A bucket would never gain tokens.
    #[error("local rate limit token bucket tokens_per_fill must be greater than zero")]
    ZeroTokensPerFill,
    /// A condition matcher names no header.
    #[error("local rate limit condition {index} has a matcher with an empty key")]
    EmptyMatchKey {
        /// Position of the offending condition.
        index: usize,
    },
}
