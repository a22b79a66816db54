//! crates/proxy/src/stats.rs
//!
//! Connection manager counters shared by every connection of one listener.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

macro_rules! proxy_counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Counters, the active request gauge and the request time
        /// accumulator for one proxy listener.
        ///
        /// Every field is an atomic, so a single instance is shared behind an
        /// `Arc` by all connection managers of a listener.
        #[derive(Debug, Default)]
        pub struct ProxyStats {
            $($(#[$doc])* pub $name: Counter,)+
            /// Requests currently alive on any connection.
            pub request_active: Gauge,
            request_time_total_us: AtomicU64,
            request_time_samples: AtomicU64,
            request_time_max_us: AtomicU64,
        }

        /// Point-in-time copy of [`ProxyStats`].
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
        pub struct ProxyStatsSnapshot {
            $($(#[$doc])* pub $name: u64,)+
            /// Requests alive when the snapshot was taken.
            pub request_active: i64,
            /// Number of completed request lifetimes.
            pub request_time_samples: u64,
            /// Sum of completed request lifetimes in microseconds.
            pub request_time_total_us: u64,
            /// Longest completed request lifetime in microseconds.
            pub request_time_max_us: u64,
        }

        impl ProxyStats {
            /// Reads every counter.
            #[must_use]
            pub fn snapshot(&self) -> ProxyStatsSnapshot {
                ProxyStatsSnapshot {
                    $($name: self.$name.value(),)+
                    request_active: self.request_active.value(),
                    request_time_samples: self.request_time_samples.load(Ordering::Relaxed),
                    request_time_total_us: self.request_time_total_us.load(Ordering::Relaxed),
                    request_time_max_us: self.request_time_max_us.load(Ordering::Relaxed),
                }
            }

            /// Counter names paired with their current values, in declaration order.
            #[must_use]
            pub fn counters(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name.value()),)+]
            }
        }
    };
}

proxy_counters! {
    /// Downstream connections closed locally while requests were in flight.
    cx_destroy_local_with_active_rq,
    /// Downstream connections closed by the peer while requests were in flight.
    cx_destroy_remote_with_active_rq,
    /// Local replies of exception type.
    local_response_business_exception,
    /// Local replies carrying an application error.
    local_response_error,
    /// Local replies reporting success.
    local_response_success,
    /// Requests that went through the whole decoder filter chain.
    request,
    /// Downstream bytes that failed to decode.
    request_decoding_error,
    /// Downstream messages decoded.
    request_decoding_success,
    /// Heartbeats answered locally.
    request_event,
    /// One-way requests.
    request_oneway,
    /// Two-way requests.
    request_twoway,
    /// Stream initiations.
    request_stream,
    /// Upstream responses forwarded downstream.
    response,
    /// Upstream responses of error type.
    response_business_exception,
    /// Upstream bytes that failed to decode or correlate.
    response_decoding_error,
    /// Upstream responses decoded.
    response_decoding_success,
    /// Upstream responses whose status is an error.
    response_error,
    /// Responses lost because the downstream connection was gone.
    response_error_caused_connection_close,
    /// Upstream responses whose status is ok.
    response_success,
    /// Downstream connections closed by the idle timer.
    idle_timeout,
}

impl ProxyStats {
    /// Creates zeroed stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one completed request lifetime to the accumulator.
    pub fn record_request_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.request_time_samples.fetch_add(1, Ordering::Relaxed);
        self.request_time_total_us
            .fetch_add(micros, Ordering::Relaxed);
        self.request_time_max_us.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Adds one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtracts one.
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}
