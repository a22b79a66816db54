use std::time::{Duration, Instant};

use tracing::debug;

use crate::bucket::{TokenBucket, TokenState};
use crate::condition::{HeaderSource, RateLimitCondition};
use crate::error::RateLimitError;

mod stats;

pub use stats::{LimiterStats, LimiterStatsSnapshot};

/// Declarative limiter configuration: an optional global bucket and the
/// ordered conditions checked before it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields))]
pub struct LocalRateLimitConfig {
    /// Fallback bucket for requests that match no condition.
    #[cfg_attr(feature = "serde", serde(default))]
    pub token_bucket: Option<TokenBucket>,
    /// Condition buckets, first match wins.
    #[cfg_attr(feature = "serde", serde(default))]
    pub conditions: Vec<RateLimitCondition>,
}

#[derive(Debug)]
struct ConditionSlot {
    condition: RateLimitCondition,
    state: TokenState,
}

/// Shared local rate limiter.
///
/// All methods take `&self`; the limiter is meant to live behind an `Arc` and
/// be consulted from every connection at once.
#[derive(Debug)]
pub struct LocalRateLimiter {
    epoch: Instant,
    global: Option<TokenState>,
    conditions: Vec<ConditionSlot>,
    tick_interval: Option<Duration>,
    stats: LimiterStats,
}

impl LocalRateLimiter {
    /// Starts a builder with no buckets.
    #[must_use]
    pub fn builder() -> LocalRateLimiterBuilder {
        LocalRateLimiterBuilder::default()
    }

    /// Validates `config` and creates a limiter with every bucket full.
    pub fn new(config: LocalRateLimitConfig) -> Result<Self, RateLimitError> {
        Self::with_epoch(config, Instant::now())
    }

    /// Like [`LocalRateLimiter::new`] with an explicit time origin for
    /// [`LocalRateLimiter::on_fill_tick`].
    pub fn with_epoch(config: LocalRateLimitConfig, epoch: Instant) -> Result<Self, RateLimitError> {
        if let Some(bucket) = &config.token_bucket {
            bucket.validate()?;
        }
        for (index, condition) in config.conditions.iter().enumerate() {
            condition.token_bucket.validate()?;
            if condition.matches.iter().any(|matcher| matcher.key.is_empty()) {
                return Err(RateLimitError::EmptyMatchKey { index });
            }
        }

        let tick_interval = config
            .token_bucket
            .iter()
            .chain(config.conditions.iter().map(|c| &c.token_bucket))
            .map(TokenBucket::fill_interval)
            .min();

        Ok(Self {
            epoch,
            global: config.token_bucket.map(TokenState::new),
            conditions: config
                .conditions
                .into_iter()
                .map(|condition| ConditionSlot {
                    state: TokenState::new(condition.token_bucket),
                    condition,
                })
                .collect(),
            tick_interval,
            stats: LimiterStats::default(),
        })
    }

    /// Period at which [`LocalRateLimiter::on_fill_tick`] should be driven:
    /// the smallest configured fill interval, or `None` without buckets.
    #[must_use]
    pub const fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval
    }

    /// Refills every bucket whose fill interval has elapsed at `now`.
    pub fn on_fill_tick(&self, now: Instant) {
        let now_ms = u64::try_from(now.saturating_duration_since(self.epoch).as_millis())
            .unwrap_or(u64::MAX);
        if let Some(global) = &self.global {
            global.on_fill_tick(now_ms);
        }
        for slot in &self.conditions {
            slot.state.on_fill_tick(now_ms);
        }
    }

    /// Consumes a token for a request carrying `headers`.
    ///
    /// The first matching condition decides; otherwise the global bucket does;
    /// without a global bucket the request is allowed.
    pub fn request_allowed<H: HeaderSource + ?Sized>(&self, headers: &H) -> bool {
        let allowed = if let Some(slot) = self
            .conditions
            .iter()
            .find(|slot| slot.condition.matches(headers))
        {
            slot.state.try_consume()
        } else if let Some(global) = &self.global {
            global.try_consume()
        } else {
            true
        };

        if allowed {
            self.stats.record_ok();
        } else {
            self.stats.record_rate_limited();
            debug!(target: "meta_proxy::ratelimit", "request over local rate limit");
        }
        allowed
    }

    /// Tokens left in the global bucket.
    #[must_use]
    pub fn global_tokens(&self) -> Option<u32> {
        self.global.as_ref().map(TokenState::tokens)
    }

    /// Tokens left in the condition bucket at `index`.
    #[must_use]
    pub fn condition_tokens(&self, index: usize) -> Option<u32> {
        self.conditions.get(index).map(|slot| slot.state.tokens())
    }

    /// Capacity of the global bucket.
    #[must_use]
    pub fn global_capacity(&self) -> Option<u32> {
        self.global
            .as_ref()
            .map(|state| state.bucket().max_tokens())
    }

    /// Allow/deny counters.
    #[must_use]
    pub const fn stats(&self) -> &LimiterStats {
        &self.stats
    }
}

/// Programmatic construction of a [`LocalRateLimiter`].
#[derive(Clone, Debug, Default)]
pub struct LocalRateLimiterBuilder {
    config: LocalRateLimitConfig,
}

impl LocalRateLimiterBuilder {
    /// Sets the fallback bucket.
    pub fn global(mut self, bucket: TokenBucket) -> Self {
        self.config.token_bucket = Some(bucket);
        self
    }

    /// Appends a condition; earlier conditions take priority.
    pub fn condition(mut self, condition: RateLimitCondition) -> Self {
        self.config.conditions.push(condition);
        self
    }

    /// Validates and builds the limiter.
    pub fn build(self) -> Result<LocalRateLimiter, RateLimitError> {
        LocalRateLimiter::new(self.config)
    }
}
