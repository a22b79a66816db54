//! crates/proxy/src/rate_limit.rs
//!
//! Decoder filter that answers over-limit requests with an OverLimit error.

use std::sync::Arc;

use codec::ErrorType;
use ratelimit::{LocalRateLimitConfig, LocalRateLimiter};
use tracing::debug;

use crate::error::ProxyError;
use crate::filter::{
    DecoderFilter, DecoderFilterCallbacks, FilterChainBuilder, FilterFactory, FilterStatus,
};
use crate::reply::AppException;

/// Consults a limiter shared by every connection of a listener.
pub struct LocalRateLimitFilter {
    limiter: Arc<LocalRateLimiter>,
}

impl LocalRateLimitFilter {
    /// Creates a filter over `limiter`.
    pub const fn new(limiter: Arc<LocalRateLimiter>) -> Self {
        Self { limiter }
    }
}

impl DecoderFilter for LocalRateLimitFilter {
    fn on_message_decoded(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) -> FilterStatus {
        if self.limiter.request_allowed(callbacks.metadata().headers()) {
            return FilterStatus::ContinueIteration;
        }
        debug!(target: "meta_proxy::ratelimit", request_id = callbacks.request_id(), "rate limited");
        let reply = AppException::new(ErrorType::OverLimit, "local rate limit: request over limit");
        callbacks.send_local_reply(&reply, false);
        FilterStatus::AbortIteration
    }
}

/// Factory owning the shared limiter.
pub struct LocalRateLimitFactory {
    limiter: Arc<LocalRateLimiter>,
}

impl LocalRateLimitFactory {
    /// Builds the limiter described by `config`.
    pub fn new(config: LocalRateLimitConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            limiter: Arc::new(LocalRateLimiter::new(config)?),
        })
    }

    /// Wraps an existing limiter.
    pub const fn from_limiter(limiter: Arc<LocalRateLimiter>) -> Self {
        Self { limiter }
    }

    /// The limiter, whose fill tick the runtime drives.
    pub const fn limiter(&self) -> &Arc<LocalRateLimiter> {
        &self.limiter
    }
}

impl FilterFactory for LocalRateLimitFactory {
    fn name(&self) -> &'static str {
        "local_ratelimit"
    }

    fn create_filters(&self, chain: &mut FilterChainBuilder) {
        chain.add_decoder_filter(Box::new(LocalRateLimitFilter::new(Arc::clone(
            &self.limiter,
        ))));
    }
}
