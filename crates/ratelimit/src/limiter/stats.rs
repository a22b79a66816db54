use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a limiter.
#[derive(Debug, Default)]
pub struct LimiterStats {
    ok: AtomicU64,
    rate_limited: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LimiterStatsSnapshot {
    /// Requests that obtained a token.
    pub ok: u64,
    /// Requests rejected for lack of tokens.
    pub rate_limited: u64,
}

impl LimiterStats {
    pub(crate) fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads both counters.
    #[must_use]
    pub fn snapshot(&self) -> LimiterStatsSnapshot {
        LimiterStatsSnapshot {
            ok: self.ok.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}
