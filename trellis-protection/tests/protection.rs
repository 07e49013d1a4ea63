use std::time::Duration;

use trellis_core::Kind;
use trellis_protection::{
    BreakerStrategy, CircuitBreakerRule, ProtectionConfig, ProtectionEngine, RateLimitRule,
};

fn health_rate_rule() -> RateLimitRule {
    RateLimitRule {
        name: "health".into(),
        resource: "api:health".into(),
        threshold: 10.0,
        stat_interval_ms: 1_000,
        enabled: true,
        description: None,
    }
}

fn users_breaker_rule() -> CircuitBreakerRule {
    CircuitBreakerRule {
        name: "users-get".into(),
        resource: "api:users:get".into(),
        strategy: BreakerStrategy::ErrorRatio,
        enabled: true,
        retry_timeout_ms: 5_000,
        min_request_amount: 20,
        stat_interval_ms: 1_000,
        stat_sliding_window_bucket_count: 10,
        max_allowed_rt_ms: 0,
        threshold: 0.5,
        probe_num: 3,
        description: None,
    }
}

fn engine(rate: Vec<RateLimitRule>, breakers: Vec<CircuitBreakerRule>) -> ProtectionEngine {
    let mut config = ProtectionConfig::default();
    config.enabled = true;
    config.rate_limit_rules = rate;
    config.circuit_breakers = breakers;
    ProtectionEngine::new(config)
}

// Scenario: 15 requests burst into a threshold=10 window. The first ten
// pass with remaining counting down 9..0, the last five are rejected with
// remaining 0, and after a quiet second the window refills.
#[tokio::test(start_paused = true)]
async fn rate_limit_burst_then_recovery() {
    let engine = engine(vec![health_rate_rule()], vec![]);

    let mut remaining_seen = Vec::new();
    let mut rejected = 0;
    for _ in 0..15 {
        match engine.check("api:health") {
            Ok(permit) => {
                remaining_seen.push(permit.rate.unwrap().remaining);
                engine.record(permit, None, Duration::from_millis(1));
            }
            Err(denied) => {
                assert_eq!(denied.kind, Kind::RateLimited);
                assert_eq!(denied.rate.unwrap().remaining, 0);
                rejected += 1;
            }
        }
    }
    assert_eq!(remaining_seen, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
    assert_eq!(rejected, 5);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let permit = engine.check("api:health").expect("window refilled");
    assert_eq!(permit.rate.unwrap().remaining, 9);
}

// Scenario: thirty NotFound responses leave the breaker closed; twenty
// Internal responses in one window trip it, and the next call fails fast.
#[tokio::test(start_paused = true)]
async fn breaker_trips_on_server_errors_only() {
    let engine = engine(vec![], vec![users_breaker_rule()]);

    for _ in 0..30 {
        let permit = engine.check("api:users:get").expect("closed breaker");
        engine.record(permit, Some(Kind::NotFound), Duration::from_millis(2));
    }
    {
        let permit = engine.check("api:users:get").expect("still closed");
        engine.record(permit, Some(Kind::NotFound), Duration::from_millis(2));
    }

    // Let the business-failure traffic age out of the window, then flip
    // the outcome to server failures.
    tokio::time::advance(Duration::from_millis(1_100)).await;
    for _ in 0..20 {
        match engine.check("api:users:get") {
            Ok(permit) => engine.record(permit, Some(Kind::Internal), Duration::from_millis(2)),
            Err(denied) => panic!("tripped too early: {denied:?}"),
        }
    }
    let denied = engine.check("api:users:get").unwrap_err();
    assert_eq!(denied.kind, Kind::CircuitOpen);
}

// Recovery: after the retry timeout, exactly probe_num requests go
// through; all succeeding closes the breaker for general traffic.
#[tokio::test(start_paused = true)]
async fn breaker_recovers_through_probes() {
    let engine = engine(vec![], vec![users_breaker_rule()]);

    for _ in 0..20 {
        let permit = engine.check("api:users:get").unwrap();
        engine.record(permit, Some(Kind::Unavailable), Duration::from_millis(2));
    }
    assert!(engine.check("api:users:get").is_err());

    tokio::time::advance(Duration::from_millis(5_001)).await;

    let mut probes = Vec::new();
    for _ in 0..3 {
        probes.push(engine.check("api:users:get").expect("probe admitted"));
    }
    assert!(engine.check("api:users:get").is_err(), "probe budget exhausted");

    for permit in probes {
        engine.record(permit, None, Duration::from_millis(2));
    }
    assert!(engine.check("api:users:get").is_ok());
}

// Deadline overruns are server-side failures and count toward the trip.
#[tokio::test(start_paused = true)]
async fn deadline_exceeded_counts_as_failure() {
    let engine = engine(vec![], vec![users_breaker_rule()]);
    for _ in 0..20 {
        let permit = engine.check("api:users:get").unwrap();
        engine.record(
            permit,
            Some(Kind::DeadlineExceeded),
            Duration::from_millis(2),
        );
    }
    assert_eq!(
        engine.check("api:users:get").unwrap_err().kind,
        Kind::CircuitOpen
    );
}

// Canceled requests are client-originated and never bias the statistics.
#[tokio::test(start_paused = true)]
async fn canceled_requests_do_not_count() {
    let engine = engine(vec![], vec![users_breaker_rule()]);
    for _ in 0..40 {
        let permit = engine.check("api:users:get").unwrap();
        engine.record(permit, Some(Kind::Canceled), Duration::from_millis(2));
    }
    assert!(engine.check("api:users:get").is_ok());
}
