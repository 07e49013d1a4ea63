//! Inline protection evaluation on named resources.
//!
//! The engine owns both rule tables and all breaker state. Evaluation
//! order is fixed: the rate limiter runs before the breaker, so rejected
//! traffic never biases breaker statistics. Rule mutations are atomic with
//! respect to concurrent evaluation and take effect on the next check.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use trellis_core::{Error, Kind};

use crate::breaker::{Admission, BreakerSnapshot, CircuitBreaker};
use crate::rules::{CircuitBreakerRule, ProtectionConfig, RateLimitRule, StorageKind};
use crate::store::{MemoryWindowStore, WindowDecision, WindowStore};

/// A passed protection check. Hand it back to
/// [`ProtectionEngine::record`] with the request outcome.
pub struct Permit {
    /// Advisory rate-limit values when a rate rule matched.
    pub rate: Option<WindowDecision>,
    breaker: Option<(Arc<CircuitBreaker>, Admission)>,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

impl Permit {
    fn pass_through() -> Self {
        Self {
            rate: None,
            breaker: None,
        }
    }
}

/// A protection rejection: the typed kind plus the advisory values the
/// response still carries.
#[derive(Debug)]
pub struct Denied {
    pub kind: Kind,
    pub resource: String,
    pub rate: Option<WindowDecision>,
}

impl Denied {
    pub fn into_error(self) -> Error {
        match self.kind {
            Kind::RateLimited => Error::rate_limited(format!(
                "rate limit exceeded for resource '{}'",
                self.resource
            )),
            _ => Error::circuit_open(format!("circuit open for resource '{}'", self.resource)),
        }
    }
}

pub struct ProtectionEngine {
    enabled: bool,
    prefix: String,
    store: Arc<dyn WindowStore>,
    memory_store: Option<Arc<MemoryWindowStore>>,
    cleanup_tick: Duration,
    ttl: Duration,
    rate_rules: RwLock<HashMap<String, RateLimitRule>>,
    breaker_rules: RwLock<HashMap<String, CircuitBreakerRule>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ProtectionEngine {
    /// Build an engine over the process-local window store.
    pub fn new(config: ProtectionConfig) -> Self {
        let memory = Arc::new(MemoryWindowStore::new(config.storage.memory.max_entries));
        Self::build(config, memory.clone() as Arc<dyn WindowStore>, Some(memory))
    }

    /// Build an engine over an injected store (the `shared` storage type;
    /// the adapter implementing [`WindowStore`] lives outside the core).
    pub fn with_store(config: ProtectionConfig, store: Arc<dyn WindowStore>) -> Self {
        if config.storage.kind == StorageKind::Memory {
            tracing::warn!("storage.type is 'memory' but an external store was injected");
        }
        Self::build(config, store, None)
    }

    fn build(
        config: ProtectionConfig,
        store: Arc<dyn WindowStore>,
        memory_store: Option<Arc<MemoryWindowStore>>,
    ) -> Self {
        let rate_rules = config
            .rate_limit_rules
            .into_iter()
            .map(|r| (r.resource.clone(), r))
            .collect();
        let breaker_rules = config
            .circuit_breakers
            .into_iter()
            .map(|r| (r.resource.clone(), r))
            .collect();
        Self {
            enabled: config.enabled,
            prefix: config.storage.prefix,
            store,
            memory_store,
            cleanup_tick: config.storage.memory.cleanup_tick,
            ttl: config.storage.ttl,
            rate_rules: RwLock::new(rate_rules),
            breaker_rules: RwLock::new(breaker_rules),
            breakers: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Spawn the memory store's cleanup tick (no-op for injected stores).
    pub fn start_cleanup(&self, cancel: CancellationToken) {
        if let Some(memory) = &self.memory_store {
            memory.spawn_cleanup(self.cleanup_tick, self.ttl, cancel);
        }
    }

    fn store_key(&self, resource: &str) -> String {
        if self.prefix.is_empty() {
            resource.to_string()
        } else {
            format!("{}:{resource}", self.prefix)
        }
    }

    /// Evaluate both protections for `resource`, rate limit first.
    /// A resource with no rules passes through unmetered.
    pub fn check(&self, resource: &str) -> Result<Permit, Denied> {
        if !self.enabled {
            return Ok(Permit::pass_through());
        }

        let mut rate_decision = None;
        {
            let rules = self.rate_rules.read().expect("rate rule lock poisoned");
            if let Some(rule) = rules.get(resource).filter(|r| r.enabled) {
                let decision =
                    self.store
                        .check(&self.store_key(resource), rule.threshold, rule.window());
                if !decision.allowed {
                    return Err(Denied {
                        kind: Kind::RateLimited,
                        resource: resource.to_string(),
                        rate: Some(decision),
                    });
                }
                rate_decision = Some(decision);
            }
        }

        let breaker = {
            let rules = self.breaker_rules.read().expect("breaker rule lock poisoned");
            rules
                .get(resource)
                .filter(|r| r.enabled)
                .map(|rule| self.breaker_for(rule))
        };
        let breaker = match breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(admission) => Some((breaker, admission)),
                None => {
                    return Err(Denied {
                        kind: Kind::CircuitOpen,
                        resource: resource.to_string(),
                        rate: rate_decision,
                    });
                }
            },
            None => None,
        };

        Ok(Permit {
            rate: rate_decision,
            breaker,
        })
    }

    /// Record the request outcome for breaker accounting. `error_kind` is
    /// the failure kind, if any; only kinds that count per the taxonomy
    /// feed the error statistics.
    pub fn record(&self, permit: Permit, error_kind: Option<Kind>, latency: Duration) {
        if let Some((breaker, admission)) = permit.breaker {
            let counted = error_kind.is_some_and(|k| k.counts_for_breaker());
            breaker.record(admission, counted, latency);
        }
    }

    fn breaker_for(&self, rule: &CircuitBreakerRule) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(rule.resource.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(rule.clone())))
            .clone()
    }

    // ── Admin surface ───────────────────────────────────────────────────

    pub fn rate_rules(&self) -> Vec<RateLimitRule> {
        let rules = self.rate_rules.read().expect("rate rule lock poisoned");
        let mut out: Vec<_> = rules.values().cloned().collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    pub fn upsert_rate_rule(&self, rule: RateLimitRule) -> Result<(), trellis_core::ConfigError> {
        rule.validate()?;
        let mut rules = self.rate_rules.write().expect("rate rule lock poisoned");
        rules.insert(rule.resource.clone(), rule);
        Ok(())
    }

    /// Remove a rate rule; returns whether one existed. The store forgets
    /// the resource so a re-added rule starts from an empty window.
    pub fn delete_rate_rule(&self, resource: &str) -> bool {
        let removed = {
            let mut rules = self.rate_rules.write().expect("rate rule lock poisoned");
            rules.remove(resource).is_some()
        };
        if removed {
            self.store.reset(&self.store_key(resource));
        }
        removed
    }

    pub fn breaker_rules(&self) -> Vec<CircuitBreakerRule> {
        let rules = self.breaker_rules.read().expect("breaker rule lock poisoned");
        let mut out: Vec<_> = rules.values().cloned().collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    pub fn upsert_breaker_rule(
        &self,
        rule: CircuitBreakerRule,
    ) -> Result<(), trellis_core::ConfigError> {
        rule.validate()?;
        let mut rules = self.breaker_rules.write().expect("breaker rule lock poisoned");
        let changed = rules
            .get(&rule.resource)
            .map(|existing| existing != &rule)
            .unwrap_or(true);
        rules.insert(rule.resource.clone(), rule.clone());
        drop(rules);
        if changed {
            // State restarts under the new parameters on next evaluation.
            self.breakers.remove(&rule.resource);
        }
        Ok(())
    }

    pub fn delete_breaker_rule(&self, resource: &str) -> bool {
        let removed = {
            let mut rules = self.breaker_rules.write().expect("breaker rule lock poisoned");
            rules.remove(resource).is_some()
        };
        self.breakers.remove(resource);
        removed
    }

    pub fn force_open(&self, resource: &str) -> Result<(), Error> {
        self.configured_breaker(resource)?.force_open();
        Ok(())
    }

    pub fn force_close(&self, resource: &str) -> Result<(), Error> {
        self.configured_breaker(resource)?.force_close();
        Ok(())
    }

    fn configured_breaker(&self, resource: &str) -> Result<Arc<CircuitBreaker>, Error> {
        let rules = self.breaker_rules.read().expect("breaker rule lock poisoned");
        let rule = rules
            .get(resource)
            .ok_or_else(|| Error::not_found(format!("no circuit breaker for resource '{resource}'")))?;
        Ok(self.breaker_for(rule))
    }

    /// Current state of every instantiated breaker.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    /// Replace both rule tables from a freshly loaded config (SIGHUP).
    /// Breakers whose rule is unchanged keep their state.
    pub fn reload(&self, config: ProtectionConfig) -> Result<(), trellis_core::ConfigError> {
        for rule in &config.rate_limit_rules {
            rule.validate()?;
        }
        for rule in &config.circuit_breakers {
            rule.validate()?;
        }

        {
            let mut rules = self.rate_rules.write().expect("rate rule lock poisoned");
            *rules = config
                .rate_limit_rules
                .into_iter()
                .map(|r| (r.resource.clone(), r))
                .collect();
        }

        let new_breaker_rules: HashMap<String, CircuitBreakerRule> = config
            .circuit_breakers
            .into_iter()
            .map(|r| (r.resource.clone(), r))
            .collect();
        {
            let mut rules = self.breaker_rules.write().expect("breaker rule lock poisoned");
            self.breakers
                .retain(|resource, _| new_breaker_rules.get(resource) == rules.get(resource));
            *rules = new_breaker_rules;
        }
        tracing::info!("protection rules reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::BreakerStrategy;

    fn protection_config(
        rate: Vec<RateLimitRule>,
        breakers: Vec<CircuitBreakerRule>,
    ) -> ProtectionConfig {
        let mut config = ProtectionConfig::default();
        config.enabled = true;
        config.rate_limit_rules = rate;
        config.circuit_breakers = breakers;
        config
    }

    fn engine_with(
        rate: Vec<RateLimitRule>,
        breakers: Vec<CircuitBreakerRule>,
    ) -> ProtectionEngine {
        ProtectionEngine::new(protection_config(rate, breakers))
    }

    fn rate_rule(resource: &str, threshold: f64) -> RateLimitRule {
        RateLimitRule {
            name: resource.to_string(),
            resource: resource.to_string(),
            threshold,
            stat_interval_ms: 1_000,
            enabled: true,
            description: None,
        }
    }

    fn breaker_rule(resource: &str) -> CircuitBreakerRule {
        CircuitBreakerRule {
            name: resource.to_string(),
            resource: resource.to_string(),
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

    #[tokio::test(start_paused = true)]
    async fn unruled_resource_passes_through() {
        let engine = engine_with(vec![], vec![]);
        let permit = engine.check("http:GET:/anything").unwrap();
        assert!(permit.rate.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_engine_never_rejects() {
        let mut config = protection_config(vec![rate_rule("r", 0.0)], vec![]);
        config.enabled = false;
        let engine = ProtectionEngine::new(config);
        assert!(engine.check("r").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_rejection_carries_advisory_values() {
        let engine = engine_with(vec![rate_rule("api:health", 2.0)], vec![]);
        assert!(engine.check("api:health").is_ok());
        assert!(engine.check("api:health").is_ok());
        let denied = engine.check("api:health").unwrap_err();
        assert_eq!(denied.kind, Kind::RateLimited);
        let rate = denied.rate.unwrap();
        assert_eq!(rate.remaining, 0);
        assert_eq!(rate.limit, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn business_failures_do_not_trip_the_breaker() {
        let engine = engine_with(vec![], vec![breaker_rule("api:users:get")]);
        for _ in 0..30 {
            let permit = engine.check("api:users:get").unwrap();
            engine.record(permit, Some(Kind::NotFound), Duration::from_millis(1));
        }
        assert!(engine.check("api:users:get").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn server_failures_trip_the_breaker() {
        let engine = engine_with(vec![], vec![breaker_rule("api:users:get")]);
        for _ in 0..20 {
            let permit = engine.check("api:users:get").unwrap();
            engine.record(permit, Some(Kind::Internal), Duration::from_millis(1));
        }
        let denied = engine.check("api:users:get").unwrap_err();
        assert_eq!(denied.kind, Kind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_evaluated_before_breaker() {
        let engine = engine_with(
            vec![rate_rule("r", 5.0)],
            vec![breaker_rule("r")],
        );
        // Burst past the rate limit; the rejected requests must not have
        // touched the breaker's statistics.
        let mut rejected = 0;
        for _ in 0..10 {
            match engine.check("r") {
                Ok(permit) => engine.record(permit, None, Duration::from_millis(1)),
                Err(denied) => {
                    assert_eq!(denied.kind, Kind::RateLimited);
                    rejected += 1;
                }
            }
        }
        assert_eq!(rejected, 5);
        let snapshot = &engine.breaker_snapshots()[0];
        assert_eq!(snapshot.total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_rule_upsert_applies_next_evaluation() {
        let engine = engine_with(vec![], vec![]);
        assert!(engine.check("r").unwrap().rate.is_none());

        engine.upsert_rate_rule(rate_rule("r", 1.0)).unwrap();
        assert!(engine.check("r").unwrap().rate.is_some());
        assert!(engine.check("r").is_err());

        assert!(engine.delete_rate_rule("r"));
        assert!(engine.check("r").unwrap().rate.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn force_open_and_close() {
        let engine = engine_with(vec![], vec![breaker_rule("r")]);
        engine.force_open("r").unwrap();
        assert_eq!(engine.check("r").unwrap_err().kind, Kind::CircuitOpen);
        engine.force_close("r").unwrap();
        assert!(engine.check("r").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn force_open_unknown_resource_is_not_found() {
        let engine = engine_with(vec![], vec![]);
        let err = engine.force_open("ghost").unwrap_err();
        assert_eq!(err.kind(), Kind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_keeps_state_for_unchanged_rules() {
        let engine = engine_with(vec![], vec![breaker_rule("keep"), breaker_rule("change")]);
        // Instantiate both breakers.
        engine.check("keep").unwrap();
        engine.check("change").unwrap();
        assert_eq!(engine.breaker_snapshots().len(), 2);

        let mut changed = breaker_rule("change");
        changed.retry_timeout_ms = 9_000;
        let config = protection_config(vec![], vec![breaker_rule("keep"), changed]);
        engine.reload(config).unwrap();

        let snapshots = engine.breaker_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].resource, "keep");
    }
}
