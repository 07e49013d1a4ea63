//! Sliding-window marker stores for the rate limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one admission check, including the advisory values surfaced
/// as `X-RateLimit-*` headers. `reset_at` is an absolute Unix second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub limit: f64,
    pub remaining: u64,
    pub reset_at: u64,
}

/// The contract a rate-limit window store fulfils.
///
/// `check` must atomically (a) discard markers older than `now - window`,
/// (b) count the survivors against `threshold`, and (c) append a marker
/// when admitting. A shared (remote) realization must execute the three
/// steps as a single transaction; racing admissions against a non-atomic
/// store over-admit under burst.
pub trait WindowStore: Send + Sync + 'static {
    fn check(&self, resource: &str, threshold: f64, window: Duration) -> WindowDecision;

    /// Forget all markers for one resource (rule deletion, tests).
    fn reset(&self, resource: &str);
}

fn unix_reset(window: Duration) -> u64 {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    now + window.as_secs().max(1)
}

/// Process-local window store: per-resource marker queues in a concurrent
/// map, pruned inline on every check and swept by a periodic cleanup tick.
pub struct MemoryWindowStore {
    windows: DashMap<String, VecDeque<Instant>>,
    max_entries: usize,
}

impl MemoryWindowStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Spawn the periodic sweep removing resources idle longer than `ttl`.
    /// The task stops when `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, tick: Duration, ttl: Duration, cancel: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick.max(Duration::from_millis(10)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => store.sweep(ttl),
                }
            }
        });
    }

    /// Remove entries whose newest marker is older than `ttl`.
    pub fn sweep(&self, ttl: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, markers| {
            markers
                .back()
                .is_some_and(|newest| now.duration_since(*newest) < ttl)
        });
    }

    pub fn tracked_resources(&self) -> usize {
        self.windows.len()
    }
}

impl WindowStore for MemoryWindowStore {
    fn check(&self, resource: &str, threshold: f64, window: Duration) -> WindowDecision {
        // At capacity, brand-new resources pass unmetered rather than grow
        // the map without bound.
        if !self.windows.contains_key(resource) && self.windows.len() >= self.max_entries {
            tracing::warn!(resource, "window store at capacity, admitting unmetered");
            return WindowDecision {
                allowed: true,
                limit: threshold,
                remaining: threshold.floor() as u64,
                reset_at: unix_reset(window),
            };
        }

        let now = Instant::now();
        let mut markers = self.windows.entry(resource.to_string()).or_default();
        while markers
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= window)
        {
            markers.pop_front();
        }

        let count = markers.len() as f64;
        let allowed = count < threshold;
        if allowed {
            markers.push_back(now);
        }
        let after = markers.len() as f64;
        WindowDecision {
            allowed,
            limit: threshold,
            remaining: (threshold - after).max(0.0).floor() as u64,
            reset_at: unix_reset(window),
        }
    }

    fn reset(&self, resource: &str) {
        self.windows.remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1_000);

    #[tokio::test(start_paused = true)]
    async fn burst_admits_exactly_threshold() {
        let store = MemoryWindowStore::new(100);
        let mut allowed = 0;
        let mut rejected = 0;
        let mut last = None;
        for _ in 0..15 {
            let decision = store.check("api:health", 10.0, WINDOW);
            if decision.allowed {
                allowed += 1;
            } else {
                rejected += 1;
            }
            last = Some(decision);
        }
        assert_eq!(allowed, 10);
        assert_eq!(rejected, 5);
        assert_eq!(last.unwrap().remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let store = MemoryWindowStore::new(100);
        let remaining: Vec<u64> = (0..10)
            .map(|_| store.check("r", 10.0, WINDOW).remaining)
            .collect();
        assert_eq!(remaining, vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_refills() {
        let store = MemoryWindowStore::new(100);
        for _ in 0..10 {
            assert!(store.check("r", 10.0, WINDOW).allowed);
        }
        assert!(!store.check("r", 10.0, WINDOW).allowed);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let decision = store.check("r", 10.0, WINDOW);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_window_is_not_a_fixed_bucket() {
        let store = MemoryWindowStore::new(100);
        for _ in 0..5 {
            store.check("r", 10.0, WINDOW);
        }
        tokio::time::advance(Duration::from_millis(600)).await;
        for _ in 0..5 {
            assert!(store.check("r", 10.0, WINDOW).allowed);
        }
        // First five markers are 600ms old, still inside the window.
        assert!(!store.check("r", 10.0, WINDOW).allowed);

        tokio::time::advance(Duration::from_millis(500)).await;
        // The early five expired; the recent five remain.
        let decision = store.check("r", 10.0, WINDOW);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_overflow_admits_unmetered() {
        let store = MemoryWindowStore::new(1);
        store.check("first", 1.0, WINDOW);
        let decision = store.check("second", 1.0, WINDOW);
        assert!(decision.allowed);
        assert_eq!(store.tracked_resources(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_resources() {
        let store = MemoryWindowStore::new(100);
        store.check("idle", 5.0, WINDOW);
        tokio::time::advance(Duration::from_secs(10)).await;
        store.check("fresh", 5.0, WINDOW);
        store.sweep(Duration::from_secs(5));
        assert_eq!(store.tracked_resources(), 1);
    }
}
