#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod bucket;
mod condition;
mod error;
mod limiter;

pub use crate::bucket::{MIN_FILL_INTERVAL, TokenBucket};
pub use crate::condition::{HeaderMatch, HeaderSource, RateLimitCondition};
pub use crate::error::RateLimitError;
pub use crate::limiter::{
    LimiterStats, LimiterStatsSnapshot, LocalRateLimitConfig, LocalRateLimiter,
    LocalRateLimiterBuilder,
};
