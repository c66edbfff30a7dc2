//! End-to-end rate limiter behavior: burst, deny, refill.

use std::time::Duration;

use swarmguard::services::{KeyedLimiterPool, RateLimiter, RateLimiterConfig};

fn scenario_config() -> RateLimiterConfig {
    RateLimiterConfig {
        capacity: 5.0,
        fill_rate: 5.0,
        window: Duration::from_secs(1),
        max_per_window: 10,
    }
}

#[tokio::test]
async fn test_burst_deny_refill_cycle() {
    let limiter = RateLimiter::new(scenario_config());

    for i in 0..5 {
        assert!(limiter.try_acquire(1).is_ok(), "admission {i} should pass");
    }
    assert!(limiter.try_acquire(1).is_err(), "sixth admission must fail");

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(limiter.try_acquire(1).is_ok(), "token refilled after idle");
}

/// Invariant: after an idle interval, a burst admits at most
/// min(capacity, available + rate * elapsed) requests.
#[tokio::test]
async fn test_burst_bounded_by_capacity_after_long_idle() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        capacity: 3.0,
        fill_rate: 100.0,
        window: Duration::from_secs(60),
        max_per_window: 1_000,
    });

    // Drain, then idle long enough that refill would exceed capacity.
    for _ in 0..3 {
        limiter.try_acquire(1).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut admitted = 0;
    while limiter.try_acquire(1).is_ok() {
        admitted += 1;
        assert!(admitted <= 3, "admitted more than capacity");
    }
    assert_eq!(admitted, 3);
}

#[tokio::test]
async fn test_per_key_pool_independent_buckets() {
    let pool = KeyedLimiterPool::new(scenario_config());

    for _ in 0..5 {
        assert!(pool.try_acquire("user:dev").await.is_ok());
    }
    assert!(pool.try_acquire("user:dev").await.is_err());
    // Another key still has its full burst.
    for _ in 0..5 {
        assert!(pool.try_acquire("ip:10.0.0.9").await.is_ok());
    }

    let snapshot = pool.snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot["user:dev"].available < 1.0);
}
