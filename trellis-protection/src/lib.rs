//! Adaptive protection for named resources.
//!
//! Every request path resolves a resource key (`http:GET:/users/{id}`,
//! `rpc:user.get`, or a hand-chosen tag) and runs it through the
//! [`ProtectionEngine`]: sliding-window rate limiting first, then the
//! circuit breaker. Rules are plain data mirroring the `protection:`
//! config section and are mutable at runtime through the engine's admin
//! methods.

pub mod breaker;
pub mod engine;
pub mod rules;
pub mod store;

pub use breaker::{Admission, BreakerPhase, BreakerSnapshot, CircuitBreaker};
pub use engine::{Denied, Permit, ProtectionEngine};
pub use rules::{
    BreakerStrategy, CircuitBreakerRule, MemoryStorageConfig, ProtectionConfig, RateLimitRule,
    StorageConfig, StorageKind,
};
pub use store::{MemoryWindowStore, WindowDecision, WindowStore};
