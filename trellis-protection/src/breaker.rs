//! Per-resource circuit breaker over a sliding ring of counter buckets.
//!
//! Outcome recording is lock-free: buckets are atomics, and the phase word
//! sits behind a short mutex that never spans a handler call. Half-open
//! probe admission is an atomic counter capped at `probe_num`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::rules::{BreakerStrategy, CircuitBreakerRule};

/// Breaker phase for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// How a request was admitted; handed back to [`CircuitBreaker::record`]
/// with the observed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

const EMPTY_BUCKET: u64 = u64::MAX;

struct Bucket {
    id: AtomicU64,
    total: AtomicU64,
    errors: AtomicU64,
    slow: AtomicU64,
}

impl Bucket {
    fn empty() -> Self {
        Self {
            id: AtomicU64::new(EMPTY_BUCKET),
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            slow: AtomicU64::new(0),
        }
    }
}

struct PhaseState {
    phase: BreakerPhase,
    opened_at: Option<Instant>,
}

/// Admin-facing state snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub resource: String,
    pub phase: BreakerPhase,
    pub total: u64,
    pub errors: u64,
    pub slow: u64,
    pub probes_admitted: u32,
    pub probe_successes: u32,
    pub forced_open: bool,
}

pub struct CircuitBreaker {
    rule: CircuitBreakerRule,
    epoch: Instant,
    buckets: Vec<Bucket>,
    state: Mutex<PhaseState>,
    probes_admitted: AtomicU32,
    probe_successes: AtomicU32,
    forced_open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(rule: CircuitBreakerRule) -> Self {
        let count = rule.stat_sliding_window_bucket_count.max(1) as usize;
        Self {
            rule,
            epoch: Instant::now(),
            buckets: (0..count).map(|_| Bucket::empty()).collect(),
            state: Mutex::new(PhaseState {
                phase: BreakerPhase::Closed,
                opened_at: None,
            }),
            probes_admitted: AtomicU32::new(0),
            probe_successes: AtomicU32::new(0),
            forced_open: AtomicBool::new(false),
        }
    }

    pub fn rule(&self) -> &CircuitBreakerRule {
        &self.rule
    }

    pub fn phase(&self) -> BreakerPhase {
        self.state.lock().expect("breaker lock poisoned").phase
    }

    /// Admit or reject a request. `None` means fail fast with
    /// `CircuitOpen`; otherwise the caller must pass the returned
    /// [`Admission`] to [`record`](Self::record) once the outcome is known.
    pub fn try_acquire(&self) -> Option<Admission> {
        if self.forced_open.load(Ordering::Relaxed) {
            return None;
        }
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.phase {
            BreakerPhase::Closed => {
                drop(state);
                self.current_bucket().total.fetch_add(1, Ordering::Relaxed);
                Some(Admission::Normal)
            }
            BreakerPhase::Open => {
                let expired = state
                    .opened_at
                    .is_none_or(|t| t.elapsed() >= self.rule.retry_timeout());
                if !expired {
                    return None;
                }
                state.phase = BreakerPhase::HalfOpen;
                self.probe_successes.store(0, Ordering::Relaxed);
                self.probes_admitted.store(1, Ordering::Relaxed);
                tracing::info!(resource = %self.rule.resource, "breaker half-open, probing");
                Some(Admission::Probe)
            }
            BreakerPhase::HalfOpen => {
                let cap = self.rule.probe_num;
                let admitted = self
                    .probes_admitted
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < cap).then_some(n + 1)
                    });
                admitted.ok().map(|_| Admission::Probe)
            }
        }
    }

    /// Record a terminal outcome. `counted_error` follows the failure
    /// taxonomy: only server-side failures feed the statistics.
    pub fn record(&self, admission: Admission, counted_error: bool, latency: Duration) {
        match admission {
            Admission::Normal => {
                let bucket = self.current_bucket();
                if counted_error {
                    bucket.errors.fetch_add(1, Ordering::Relaxed);
                }
                if self.rule.max_allowed_rt_ms > 0
                    && latency.as_millis() as u64 > self.rule.max_allowed_rt_ms
                {
                    bucket.slow.fetch_add(1, Ordering::Relaxed);
                }
                self.evaluate_trip();
            }
            Admission::Probe => {
                if counted_error {
                    self.reopen();
                } else {
                    let done = self.probe_successes.fetch_add(1, Ordering::AcqRel) + 1;
                    if done >= self.rule.probe_num {
                        self.close();
                    }
                }
            }
        }
    }

    /// Pin the breaker open until [`force_close`](Self::force_close).
    pub fn force_open(&self) {
        self.forced_open.store(true, Ordering::Relaxed);
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.phase = BreakerPhase::Open;
        state.opened_at = Some(Instant::now());
    }

    /// Clear a forced or tripped state and reset statistics.
    pub fn force_close(&self) {
        self.forced_open.store(false, Ordering::Relaxed);
        self.close();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (total, errors, slow) = self.aggregate();
        BreakerSnapshot {
            resource: self.rule.resource.clone(),
            phase: self.phase(),
            total,
            errors,
            slow,
            probes_admitted: self.probes_admitted.load(Ordering::Relaxed),
            probe_successes: self.probe_successes.load(Ordering::Relaxed),
            forced_open: self.forced_open.load(Ordering::Relaxed),
        }
    }

    fn bucket_width_ms(&self) -> u64 {
        self.rule.bucket_width_ms().max(1)
    }

    fn current_id(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 / self.bucket_width_ms()
    }

    /// The live bucket for the current instant, lazily recycled. Counter
    /// updates racing a recycle at a bucket boundary may lose a few counts;
    /// the window statistics tolerate that.
    fn current_bucket(&self) -> &Bucket {
        let id = self.current_id();
        let idx = (id % self.buckets.len() as u64) as usize;
        let bucket = &self.buckets[idx];
        let stored = bucket.id.load(Ordering::Acquire);
        if stored != id
            && bucket
                .id
                .compare_exchange(stored, id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.total.store(0, Ordering::Relaxed);
            bucket.errors.store(0, Ordering::Relaxed);
            bucket.slow.store(0, Ordering::Relaxed);
        }
        bucket
    }

    /// Aggregate every bucket still inside the statistical window.
    fn aggregate(&self) -> (u64, u64, u64) {
        let current = self.current_id();
        let span = self.buckets.len() as u64;
        let oldest = current.saturating_sub(span - 1);
        let mut totals = (0, 0, 0);
        for bucket in &self.buckets {
            let id = bucket.id.load(Ordering::Acquire);
            if id == EMPTY_BUCKET || id < oldest || id > current {
                continue;
            }
            totals.0 += bucket.total.load(Ordering::Relaxed);
            totals.1 += bucket.errors.load(Ordering::Relaxed);
            totals.2 += bucket.slow.load(Ordering::Relaxed);
        }
        totals
    }

    fn evaluate_trip(&self) {
        let (total, errors, slow) = self.aggregate();
        if total < self.rule.min_request_amount {
            return;
        }
        let trip = match self.rule.strategy {
            BreakerStrategy::ErrorRatio => errors as f64 / total as f64 >= self.rule.threshold,
            BreakerStrategy::SlowRequestRatio => slow as f64 / total as f64 >= self.rule.threshold,
            BreakerStrategy::ErrorCount => errors as f64 >= self.rule.threshold,
        };
        if !trip {
            return;
        }
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.phase == BreakerPhase::Closed {
            state.phase = BreakerPhase::Open;
            state.opened_at = Some(Instant::now());
            tracing::warn!(
                resource = %self.rule.resource,
                total,
                errors,
                slow,
                "circuit breaker opened"
            );
        }
    }

    fn reopen(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.phase == BreakerPhase::HalfOpen {
            state.phase = BreakerPhase::Open;
            state.opened_at = Some(Instant::now());
            tracing::warn!(resource = %self.rule.resource, "probe failed, breaker re-opened");
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.phase = BreakerPhase::Closed;
        state.opened_at = None;
        drop(state);
        for bucket in &self.buckets {
            bucket.id.store(EMPTY_BUCKET, Ordering::Release);
            bucket.total.store(0, Ordering::Relaxed);
            bucket.errors.store(0, Ordering::Relaxed);
            bucket.slow.store(0, Ordering::Relaxed);
        }
        self.probes_admitted.store(0, Ordering::Relaxed);
        self.probe_successes.store(0, Ordering::Relaxed);
        tracing::info!(resource = %self.rule.resource, "circuit breaker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::BreakerStrategy;

    fn rule(strategy: BreakerStrategy, threshold: f64) -> CircuitBreakerRule {
        CircuitBreakerRule {
            name: "test".into(),
            resource: "api:test".into(),
            strategy,
            enabled: true,
            retry_timeout_ms: 5_000,
            min_request_amount: 20,
            stat_interval_ms: 1_000,
            stat_sliding_window_bucket_count: 10,
            max_allowed_rt_ms: 100,
            threshold,
            probe_num: 3,
            description: None,
        }
    }

    fn drive(breaker: &CircuitBreaker, n: usize, error: bool) {
        for _ in 0..n {
            if let Some(admission) = breaker.try_acquire() {
                breaker.record(admission, error, Duration::from_millis(1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trips_on_error_ratio_at_min_requests() {
        let breaker = CircuitBreaker::new(rule(BreakerStrategy::ErrorRatio, 0.5));
        drive(&breaker, 10, false);
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
        drive(&breaker, 10, true);
        assert_eq!(breaker.phase(), BreakerPhase::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn below_min_requests_never_trips() {
        let breaker = CircuitBreaker::new(rule(BreakerStrategy::ErrorRatio, 0.5));
        drive(&breaker, 19, true);
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn error_count_strategy_uses_absolute_threshold() {
        let mut r = rule(BreakerStrategy::ErrorCount, 5.0);
        r.min_request_amount = 1;
        let breaker = CircuitBreaker::new(r);
        drive(&breaker, 4, true);
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
        drive(&breaker, 1, true);
        assert_eq!(breaker.phase(), BreakerPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_trip_slow_ratio() {
        let mut r = rule(BreakerStrategy::SlowRequestRatio, 0.5);
        r.min_request_amount = 10;
        let breaker = CircuitBreaker::new(r);
        for _ in 0..10 {
            let admission = breaker.try_acquire().unwrap();
            breaker.record(admission, false, Duration::from_millis(500));
        }
        assert_eq!(breaker.phase(), BreakerPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_until_retry_timeout_then_probes() {
        let breaker = CircuitBreaker::new(rule(BreakerStrategy::ErrorRatio, 0.5));
        drive(&breaker, 20, true);
        assert_eq!(breaker.phase(), BreakerPhase::Open);
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_millis(5_001)).await;

        // Exactly probe_num admissions, no more while probes are pending.
        let first = breaker.try_acquire().expect("first probe");
        assert_eq!(first, Admission::Probe);
        assert!(breaker.try_acquire().is_some());
        assert!(breaker.try_acquire().is_some());
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn all_probe_successes_close_the_breaker() {
        let breaker = CircuitBreaker::new(rule(BreakerStrategy::ErrorRatio, 0.5));
        drive(&breaker, 20, true);
        tokio::time::advance(Duration::from_millis(5_001)).await;

        for _ in 0..3 {
            let admission = breaker.try_acquire().expect("probe");
            breaker.record(admission, false, Duration::from_millis(1));
        }
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
        // Statistics were reset along with the close.
        assert_eq!(breaker.snapshot().errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_rearms_the_timer() {
        let breaker = CircuitBreaker::new(rule(BreakerStrategy::ErrorRatio, 0.5));
        drive(&breaker, 20, true);
        tokio::time::advance(Duration::from_millis(5_001)).await;

        let admission = breaker.try_acquire().expect("probe");
        breaker.record(admission, true, Duration::from_millis(1));
        assert_eq!(breaker.phase(), BreakerPhase::Open);
        assert!(breaker.try_acquire().is_none());

        // Timer restarted from the failed probe, not the original trip.
        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert!(breaker.try_acquire().is_none());
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_buckets_age_out_of_the_window() {
        let mut r = rule(BreakerStrategy::ErrorRatio, 0.5);
        r.min_request_amount = 5;
        let breaker = CircuitBreaker::new(r);
        drive(&breaker, 4, true);
        // Let the whole window pass; those errors no longer count.
        tokio::time::advance(Duration::from_millis(1_100)).await;
        drive(&breaker, 4, false);
        assert_eq!(breaker.phase(), BreakerPhase::Closed);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.errors, 0);
        assert_eq!(snapshot.total, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn force_open_is_sticky() {
        let breaker = CircuitBreaker::new(rule(BreakerStrategy::ErrorRatio, 0.5));
        breaker.force_open();
        assert!(breaker.try_acquire().is_none());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.try_acquire().is_none());
        breaker.force_close();
        assert!(breaker.try_acquire().is_some());
    }
}
