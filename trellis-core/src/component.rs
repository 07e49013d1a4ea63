//! The component model: named, lifecycle-managed units.
//!
//! A [`Component`] declares its name, version, and dependencies, and
//! implements the `init`/`start`/`stop` transitions plus a [`health`]
//! probe. The registry stores components type-erased; service interfaces
//! are exposed through small capability traits on the concrete type, not
//! by downcasting.
//!
//! [`health`]: Component::health

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Error;

/// Lifecycle phase of a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Unknown,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl Status {
    /// Whether the state machine admits `self -> to`. Transitions are
    /// one-directional except the `Stopped`/`Failed` re-entries into
    /// `Initializing`; `Destroyed` is terminal. `Failed` is reachable from
    /// any live phase, since the lifecycle manager marks never-started
    /// dependents failed when a dependency goes down.
    pub fn can_transition(self, to: Status) -> bool {
        use Status::*;
        if self == Destroyed {
            return false;
        }
        if to == Destroyed {
            return true;
        }
        if to == Failed {
            return self != Failed;
        }
        matches!(
            (self, to),
            (Unknown, Initializing)
                | (Initializing, Initialized)
                | (Initialized, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Initializing)
                | (Failed, Initializing)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Initializing => "initializing",
            Status::Initialized => "initialized",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
            Status::Destroyed => "destroyed",
        }
    }
}

/// Health phase reported by a component probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a single health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Probe latency; `None` until the first managed poll fills it in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            message: None,
            checked_at: Utc::now(),
            latency: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Degraded,
            message: Some(message.into()),
            checked_at: Utc::now(),
            latency: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            message: Some(message.into()),
            checked_at: Utc::now(),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// Context handed to a component during `init`: an immutable snapshot of
/// the configuration, taken once per initialization.
#[derive(Clone)]
pub struct ComponentContext {
    config: Arc<Config>,
}

impl ComponentContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_arc(&self) -> Arc<Config> {
        self.config.clone()
    }
}

/// A named, lifecycle-managed unit.
///
/// Dependencies are named components that must reach `Running` before this
/// one starts. Implementations keep `init` idempotent: a restart re-runs it
/// with the last-known config snapshot.
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn init(&self, ctx: &ComponentContext) -> impl Future<Output = Result<(), Error>> + Send;

    fn start(&self) -> impl Future<Output = Result<(), Error>> + Send;

    fn stop(&self) -> impl Future<Output = Result<(), Error>> + Send;

    fn health(&self) -> impl Future<Output = HealthReport> + Send {
        async { HealthReport::healthy() }
    }
}

/// Object-safe form of [`Component`] stored by the registry.
#[doc(hidden)]
pub trait ComponentObject: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn dependencies(&self) -> Vec<String>;
    fn init<'a>(
        &'a self,
        ctx: &'a ComponentContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
    fn health(&self) -> Pin<Box<dyn Future<Output = HealthReport> + Send + '_>>;
}

impl<T: Component> ComponentObject for T {
    fn name(&self) -> &str {
        Component::name(self)
    }

    fn version(&self) -> &str {
        Component::version(self)
    }

    fn dependencies(&self) -> Vec<String> {
        Component::dependencies(self)
    }

    fn init<'a>(
        &'a self,
        ctx: &'a ComponentContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(Component::init(self, ctx))
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(Component::start(self))
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(Component::stop(self))
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = HealthReport> + Send + '_>> {
        Box::pin(Component::health(self))
    }
}

/// Snapshot of one component's lifecycle state, as served by the admin API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ComponentStatusInfo {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub status: String,
    pub health: HealthReport,
}

/// Capability interface the lifecycle manager exposes to admin surfaces.
///
/// Transport crates must not depend on the facade crate, so the manager is
/// injected as `Arc<dyn LifecycleControl>` where the admin router needs it.
pub trait LifecycleControl: Send + Sync {
    fn statuses(&self) -> Vec<ComponentStatusInfo>;

    /// Stop, re-initialize with the last-known config, and start `name`.
    /// Refused with `DependentsRunning` unless `cascade` is set.
    fn restart<'a>(
        &'a self,
        name: &'a str,
        cascade: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_admitted() {
        use Status::*;
        for (from, to) in [
            (Unknown, Initializing),
            (Initializing, Initialized),
            (Initialized, Starting),
            (Starting, Running),
            (Running, Stopping),
            (Stopping, Stopped),
        ] {
            assert!(from.can_transition(to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn restart_and_retry_reentries() {
        assert!(Status::Stopped.can_transition(Status::Initializing));
        assert!(Status::Failed.can_transition(Status::Initializing));
    }

    #[test]
    fn destroyed_is_terminal() {
        assert!(Status::Running.can_transition(Status::Destroyed));
        assert!(!Status::Destroyed.can_transition(Status::Initializing));
        assert!(!Status::Destroyed.can_transition(Status::Destroyed));
    }

    #[test]
    fn backwards_transitions_rejected() {
        assert!(!Status::Running.can_transition(Status::Initializing));
        assert!(!Status::Stopped.can_transition(Status::Running));
        assert!(!Status::Initialized.can_transition(Status::Unknown));
    }

    #[test]
    fn failed_reachable_from_any_live_phase() {
        assert!(Status::Unknown.can_transition(Status::Failed));
        assert!(Status::Initializing.can_transition(Status::Failed));
        assert!(Status::Running.can_transition(Status::Failed));
        assert!(!Status::Destroyed.can_transition(Status::Failed));
    }
}
