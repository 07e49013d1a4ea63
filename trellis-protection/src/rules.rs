//! Protection rule schema and validation.
//!
//! Field names match the `protection:` config section one-for-one, so the
//! structs double as the admin API's wire format.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_core::config::sections::{duration_serde, Section};
use trellis_core::config::{Config, ConfigError};

fn default_enabled() -> bool {
    true
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section: "protection".to_string(),
        reason: reason.into(),
    }
}

/// Sliding-window rate limit on one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub name: String,
    pub resource: String,
    /// Requests permitted per window.
    pub threshold: f64,
    /// Window width in milliseconds.
    pub stat_interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.stat_interval_ms)
    }

    /// Effective queries-per-second this rule admits.
    pub fn effective_qps(&self) -> f64 {
        self.threshold * 1000.0 / self.stat_interval_ms as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource.is_empty() {
            return Err(invalid(format!("rate limit rule '{}': empty resource", self.name)));
        }
        if self.threshold < 0.0 {
            return Err(invalid(format!(
                "rate limit rule '{}': threshold must be non-negative",
                self.name
            )));
        }
        if self.stat_interval_ms == 0 {
            return Err(invalid(format!(
                "rate limit rule '{}': stat_interval_ms must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// How a breaker decides to trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerStrategy {
    ErrorRatio,
    ErrorCount,
    SlowRequestRatio,
}

/// Circuit-breaker rule for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRule {
    pub name: String,
    pub resource: String,
    pub strategy: BreakerStrategy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub retry_timeout_ms: u64,
    pub min_request_amount: u64,
    pub stat_interval_ms: u64,
    #[serde(default = "default_bucket_count")]
    pub stat_sliding_window_bucket_count: u32,
    /// Latency above which a request counts as slow (SlowRequestRatio only).
    #[serde(default)]
    pub max_allowed_rt_ms: u64,
    /// Ratio in `[0, 1]` for ratio strategies; a whole count for ErrorCount.
    pub threshold: f64,
    #[serde(default = "default_probe_num")]
    pub probe_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_bucket_count() -> u32 {
    10
}

fn default_probe_num() -> u32 {
    3
}

impl CircuitBreakerRule {
    pub fn bucket_width_ms(&self) -> u64 {
        self.stat_interval_ms / self.stat_sliding_window_bucket_count as u64
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tag = format!("circuit breaker '{}'", self.name);
        if self.resource.is_empty() {
            return Err(invalid(format!("{tag}: empty resource")));
        }
        if self.stat_sliding_window_bucket_count == 0 {
            return Err(invalid(format!("{tag}: bucket count must be positive")));
        }
        if self.stat_interval_ms == 0
            || self.stat_interval_ms % self.stat_sliding_window_bucket_count as u64 != 0
        {
            return Err(invalid(format!(
                "{tag}: stat_interval_ms must be a positive multiple of the bucket count"
            )));
        }
        if self.min_request_amount == 0 {
            return Err(invalid(format!("{tag}: min_request_amount must be positive")));
        }
        match self.strategy {
            BreakerStrategy::ErrorRatio | BreakerStrategy::SlowRequestRatio => {
                if !(0.0..=1.0).contains(&self.threshold) {
                    return Err(invalid(format!(
                        "{tag}: ratio threshold must be within [0, 1]"
                    )));
                }
            }
            BreakerStrategy::ErrorCount => {
                if self.threshold < 0.0 || self.threshold.fract() != 0.0 {
                    return Err(invalid(format!(
                        "{tag}: count threshold must be a non-negative integer"
                    )));
                }
            }
        }
        if self.strategy == BreakerStrategy::SlowRequestRatio && self.max_allowed_rt_ms == 0 {
            return Err(invalid(format!(
                "{tag}: max_allowed_rt_ms is required for SlowRequestRatio"
            )));
        }
        if self.probe_num == 0 {
            return Err(invalid(format!("{tag}: probe_num must be positive")));
        }
        Ok(())
    }
}

/// Which store backs the rate-limit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Shared,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryStorageConfig {
    pub max_entries: usize,
    #[serde(with = "duration_serde")]
    pub cleanup_tick: Duration,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            cleanup_tick: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub prefix: String,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            prefix: "trellis:protection".to_string(),
            ttl: Duration::from_secs(300),
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// The `protection:` config section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProtectionConfig {
    pub enabled: bool,
    pub storage: StorageConfig,
    pub rate_limit_rules: Vec<RateLimitRule>,
    pub circuit_breakers: Vec<CircuitBreakerRule>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

impl Section for ProtectionConfig {
    const NAME: &'static str = "protection";

    fn unknown_keys(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.unknown
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rate_limit_rules {
            rule.validate()?;
        }
        for rule in &self.circuit_breakers {
            rule.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rate_limit_rules {
            if !seen.insert(&rule.resource) {
                return Err(invalid(format!(
                    "duplicate rate limit rule for resource '{}'",
                    rule.resource
                )));
            }
        }
        seen.clear();
        for rule in &self.circuit_breakers {
            if !seen.insert(&rule.resource) {
                return Err(invalid(format!(
                    "duplicate circuit breaker for resource '{}'",
                    rule.resource
                )));
            }
        }
        Ok(())
    }
}

impl ProtectionConfig {
    pub fn load(config: &Config) -> Result<Self, ConfigError> {
        Ok(<Self as Section>::load(config)?.unwrap_or_default())
    }
}
