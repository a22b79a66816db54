//! Token-bucket invariants under arbitrary consume/refill schedules.

use std::time::{Duration, Instant};

use proptest::prelude::*;
use ratelimit::{LocalRateLimitConfig, LocalRateLimiter, TokenBucket};

#[derive(Clone, Debug)]
enum Step {
    Consume(u8),
    Advance(u16),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1u8..20).prop_map(Step::Consume),
        (0u16..400).prop_map(Step::Advance),
    ]
}

proptest! {
    #[test]
    fn tokens_stay_within_capacity(
        max in 0u32..50,
        per_fill in 1u32..20,
        interval_ms in 50u64..300,
        steps in prop::collection::vec(step(), 1..60),
    ) {
        let epoch = Instant::now();
        let limiter = LocalRateLimiter::with_epoch(
            LocalRateLimitConfig {
                token_bucket: Some(TokenBucket::new(max, per_fill, Duration::from_millis(interval_ms))),
                conditions: Vec::new(),
            },
            epoch,
        ).unwrap();
        let empty: [(&str, &str); 0] = [];

        let mut now_ms = 0u64;
        let mut last_fill_ms = 0u64;
        let mut model = max;
        for step in steps {
            match step {
                Step::Consume(n) => {
                    for _ in 0..n {
                        let expected = model > 0;
                        prop_assert_eq!(limiter.request_allowed(&empty[..]), expected);
                        if expected {
                            model -= 1;
                        }
                    }
                }
                Step::Advance(ms) => {
                    now_ms += u64::from(ms);
                    limiter.on_fill_tick(epoch + Duration::from_millis(now_ms));
                    if now_ms - last_fill_ms >= interval_ms {
                        model = model.saturating_add(per_fill).min(max);
                        last_fill_ms = now_ms;
                    }
                }
            }
            prop_assert_eq!(limiter.global_tokens(), Some(model));
            prop_assert!(model <= max);
        }
    }

    #[test]
    fn grants_never_exceed_capacity_plus_refills(
        max in 1u32..30,
        requests in 0usize..200,
    ) {
        let limiter = LocalRateLimiter::builder()
            .global(TokenBucket::new(max, 1, Duration::from_secs(1)))
            .build()
            .unwrap();
        let empty: [(&str, &str); 0] = [];
        let granted = (0..requests).filter(|_| limiter.request_allowed(&empty[..])).count();
        prop_assert_eq!(granted, requests.min(max as usize));
        let stats = limiter.stats().snapshot();
        prop_assert_eq!(stats.ok + stats.rate_limited, requests as u64);
    }
}
