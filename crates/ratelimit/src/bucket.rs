//! Token bucket parameters and the shared atomic token counter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::RateLimitError;

/// Shortest fill interval a bucket may be configured with.
pub const MIN_FILL_INTERVAL: Duration = Duration::from_millis(50);

/// Static parameters of one token bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields))]
pub struct TokenBucket {
    max_tokens: u32,
    #[cfg_attr(feature = "serde", serde(default = "default_tokens_per_fill"))]
    tokens_per_fill: u32,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "fill_interval_ms", with = "millis")
    )]
    fill_interval: Duration,
}

#[cfg(feature = "serde")]
const fn default_tokens_per_fill() -> u32 {
    1
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl TokenBucket {
    /// Creates a bucket that starts full with `max_tokens` and gains
    /// `tokens_per_fill` tokens every `fill_interval`.
    #[must_use]
    pub const fn new(max_tokens: u32, tokens_per_fill: u32, fill_interval: Duration) -> Self {
        Self {
            max_tokens,
            tokens_per_fill,
            fill_interval,
        }
    }

    /// Capacity of the bucket, also its initial token count.
    #[must_use]
    pub const fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Tokens added on each refill.
    #[must_use]
    pub const fn tokens_per_fill(&self) -> u32 {
        self.tokens_per_fill
    }

    /// Minimum time between two refills.
    #[must_use]
    pub const fn fill_interval(&self) -> Duration {
        self.fill_interval
    }

    pub(crate) fn validate(&self) -> Result<(), RateLimitError> {
        if self.fill_interval < MIN_FILL_INTERVAL {
            return Err(RateLimitError::FillIntervalTooShort {
                min: MIN_FILL_INTERVAL,
                actual: self.fill_interval,
            });
        }
        if self.tokens_per_fill == 0 {
            return Err(RateLimitError::ZeroTokensPerFill);
        }
        Ok(())
    }

    fn fill_interval_ms(&self) -> u64 {
        u64::try_from(self.fill_interval.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Live token count of a bucket plus the time of its last refill, expressed
/// in milliseconds since the owning limiter was created.
///
/// Relaxed ordering is enough everywhere: only the final value of each
/// counter matters, not its ordering relative to other memory.
#[derive(Debug)]
pub(crate) struct TokenState {
    bucket: TokenBucket,
    tokens: AtomicU32,
    last_fill_ms: AtomicU64,
}

impl TokenState {
    pub(crate) const fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket,
            tokens: AtomicU32::new(bucket.max_tokens),
            last_fill_ms: AtomicU64::new(0),
        }
    }

    pub(crate) const fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub(crate) fn tokens(&self) -> u32 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Takes one token. Returns `false` without touching the counter when the
    /// bucket is empty.
    pub(crate) fn try_consume(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                tokens.checked_sub(1)
            })
            .is_ok()
    }

    /// Refills the bucket when at least one fill interval has passed since the
    /// previous refill. Concurrent ticks race on the refill timestamp so only
    /// one of them adds tokens for a given interval.
    pub(crate) fn on_fill_tick(&self, now_ms: u64) -> bool {
        let last = self.last_fill_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.bucket.fill_interval_ms() {
            return false;
        }
        if self
            .last_fill_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let max = self.bucket.max_tokens;
        let per_fill = self.bucket.tokens_per_fill;
        // The closure always returns `Some`, so the update cannot fail.
        let _ = self
            .tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                Some(tokens.saturating_add(per_fill).min(max))
            });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(max: u32, per_fill: u32, interval_ms: u64) -> TokenBucket {
        TokenBucket::new(max, per_fill, Duration::from_millis(interval_ms))
    }

    #[test]
    fn starts_full_and_drains_to_zero() {
        let state = TokenState::new(bucket(3, 1, 100));
        assert_eq!(state.tokens(), 3);
        assert!(state.try_consume());
        assert!(state.try_consume());
        assert!(state.try_consume());
        assert!(!state.try_consume());
        assert_eq!(state.tokens(), 0);
    }

    #[test]
    fn refill_waits_for_the_interval() {
        let state = TokenState::new(bucket(2, 1, 100));
        assert!(state.try_consume());
        assert!(state.try_consume());

        assert!(!state.on_fill_tick(99));
        assert_eq!(state.tokens(), 0);
        assert!(state.on_fill_tick(100));
        assert_eq!(state.tokens(), 1);
        assert!(!state.on_fill_tick(150));
        assert!(state.on_fill_tick(200));
        assert_eq!(state.tokens(), 2);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let state = TokenState::new(bucket(5, 4, 50));
        assert!(state.try_consume());
        assert!(state.on_fill_tick(50));
        assert_eq!(state.tokens(), 5);
    }

    #[test]
    fn refill_does_not_overflow() {
        let state = TokenState::new(bucket(u32::MAX, u32::MAX, 50));
        assert!(state.on_fill_tick(50));
        assert_eq!(state.tokens(), u32::MAX);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let state = TokenState::new(bucket(0, 1, 50));
        assert!(!state.try_consume());
        assert!(state.on_fill_tick(50));
        assert!(!state.try_consume());
    }

    #[test]
    fn validation_enforces_minimum_interval() {
        assert_eq!(
            bucket(1, 1, 49).validate(),
            Err(RateLimitError::FillIntervalTooShort {
                min: MIN_FILL_INTERVAL,
                actual: Duration::from_millis(49),
            })
        );
        assert!(bucket(1, 1, 50).validate().is_ok());
        assert_eq!(
            bucket(1, 0, 50).validate(),
            Err(RateLimitError::ZeroTokensPerFill)
        );
    }
}
