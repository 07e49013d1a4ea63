//! Dependency-ordered lifecycle driving: Init → Start → Stop in
//! topological waves over the component registry.
//!
//! Components at equal depth run concurrently; order within a wave is
//! deterministic by name. A component failing during startup never blocks
//! its peers; its transitive dependents are marked failed with cause
//! `dependency-unavailable` and are not started. Every transition
//! publishes a `plugin.*` event.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use trellis_core::{
    ComponentRegistry, ComponentStatusInfo, Config, Error, HealthReport, LifecycleControl,
    RegistryError, Status,
};
use trellis_events::{types, Event, EventBus};

const CAUSE_DEPENDENCY: &str = "dependency-unavailable";
const CAUSE_TIMEOUT: &str = "startup-timeout";

pub struct LifecycleManager {
    registry: Arc<ComponentRegistry>,
    bus: EventBus,
    config: Arc<Config>,
    max_startup_time: Duration,
    health_interval: Duration,
}

impl LifecycleManager {
    pub fn new(registry: Arc<ComponentRegistry>, bus: EventBus, config: Arc<Config>) -> Self {
        let max_startup_time = config
            .get("app.max_startup_time")
            .unwrap_or(Duration::from_secs(30));
        let health_interval = config
            .get("app.health_interval")
            .unwrap_or(Duration::from_secs(15));
        Self {
            registry,
            bus,
            config,
            max_startup_time,
            health_interval,
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Initialize every component in dependency order.
    pub async fn init_all(&self) -> Result<(), RegistryError> {
        let waves = self.registry.topo_waves()?;
        for wave in waves {
            join_all(wave.iter().map(|name| self.init_component(name))).await;
        }
        Ok(())
    }

    /// Start every initialized component in dependency order.
    pub async fn start_all(&self) -> Result<(), RegistryError> {
        let waves = self.registry.topo_waves()?;
        for wave in waves {
            join_all(wave.iter().map(|name| self.start_component(name))).await;
        }
        Ok(())
    }

    /// Stop running components in reverse dependency order.
    pub async fn stop_all(&self) -> Result<(), RegistryError> {
        let mut waves = self.registry.topo_waves()?;
        waves.reverse();
        for wave in waves {
            join_all(wave.iter().map(|name| self.stop_component(name))).await;
        }
        Ok(())
    }

    async fn init_component(&self, name: &str) {
        let Ok(component) = self.registry.get_any(name) else {
            return;
        };
        // A failed dependency poisons this component before any work runs.
        for dep in component.dependencies() {
            let ready = matches!(
                self.registry.status(&dep),
                Ok(Status::Initialized | Status::Running)
            );
            if !ready {
                self.mark_failed(name, CAUSE_DEPENDENCY);
                return;
            }
        }
        if self.registry.transition(name, Status::Initializing).is_err() {
            return;
        }
        let ctx = self.registry.init_context(name, &self.config);
        let _ = self
            .registry
            .set_config_snapshot(name, ctx.config_arc());
        match tokio::time::timeout(self.max_startup_time, component.init(&ctx)).await {
            Ok(Ok(())) => {
                let _ = self.registry.transition(name, Status::Initialized);
                self.publish(types::PLUGIN_INITIALIZED, name, None);
            }
            Ok(Err(e)) => {
                tracing::error!(component = name, error = %e, "component init failed");
                self.mark_failed(name, &e.to_string());
            }
            Err(_) => {
                tracing::error!(component = name, "component init timed out");
                self.mark_failed(name, CAUSE_TIMEOUT);
            }
        }
    }

    async fn start_component(&self, name: &str) {
        let Ok(component) = self.registry.get_any(name) else {
            return;
        };
        if self.registry.status(name) != Ok(Status::Initialized) {
            return;
        }
        for dep in component.dependencies() {
            if self.registry.status(&dep) != Ok(Status::Running) {
                self.mark_failed(name, CAUSE_DEPENDENCY);
                return;
            }
        }
        if self.registry.transition(name, Status::Starting).is_err() {
            return;
        }
        match tokio::time::timeout(self.max_startup_time, component.start()).await {
            Ok(Ok(())) => {
                let _ = self.registry.transition(name, Status::Running);
                self.publish(types::PLUGIN_STARTED, name, None);
            }
            Ok(Err(e)) => {
                tracing::error!(component = name, error = %e, "component start failed");
                self.mark_failed(name, &e.to_string());
            }
            Err(_) => {
                tracing::error!(component = name, "component start timed out");
                self.mark_failed(name, CAUSE_TIMEOUT);
            }
        }
    }

    async fn stop_component(&self, name: &str) {
        if self.registry.status(name) != Ok(Status::Running) {
            return;
        }
        let Ok(component) = self.registry.get_any(name) else {
            return;
        };
        if self.registry.transition(name, Status::Stopping).is_err() {
            return;
        }
        match component.stop().await {
            Ok(()) => {
                let _ = self.registry.transition(name, Status::Stopped);
                self.publish(types::PLUGIN_STOPPED, name, None);
            }
            Err(e) => {
                tracing::error!(component = name, error = %e, "component stop failed");
                self.mark_failed(name, &e.to_string());
            }
        }
    }

    /// Restart one component: stop, re-init with the last-known config
    /// snapshot, start. With `cascade`, running dependents are stopped
    /// first and brought back afterwards in dependency order.
    pub async fn restart(&self, name: &str, cascade: bool) -> Result<(), Error> {
        if !self.registry.contains(name) {
            return Err(Error::not_found(format!("component '{name}' is not registered")));
        }
        let running_dependents: Vec<String> = self
            .registry
            .transitive_dependents(name)
            .into_iter()
            .filter(|d| self.registry.status(d) == Ok(Status::Running))
            .collect();
        if !running_dependents.is_empty() && !cascade {
            return Err(Error::conflict(
                RegistryError::DependentsRunning {
                    component: name.to_string(),
                    dependents: running_dependents,
                }
                .to_string(),
            ));
        }

        // Stop dependents leaf-first, then the target.
        for dependent in running_dependents.iter().rev() {
            self.stop_component(dependent).await;
        }
        self.stop_component(name).await;

        self.init_component(name).await;
        self.start_component(name).await;
        if self.registry.status(name) != Ok(Status::Running) {
            return Err(Error::unavailable(format!(
                "component '{name}' did not reach running after restart"
            )));
        }

        // Bring dependents back root-first.
        for dependent in running_dependents.iter() {
            // A stopped dependent re-enters through init.
            self.init_component(dependent).await;
            self.start_component(dependent).await;
        }
        Ok(())
    }

    /// Poll running components' health until `cancel` fires, publishing
    /// `plugin.health.changed` on phase changes.
    pub fn spawn_health_poller(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => manager.poll_health().await,
                }
            }
        });
    }

    async fn poll_health(&self) {
        for name in self.registry.names() {
            if self.registry.status(&name) != Ok(Status::Running) {
                continue;
            }
            let Ok(component) = self.registry.get_any(&name) else {
                continue;
            };
            let started = tokio::time::Instant::now();
            let report = component.health().await;
            let report = HealthReport {
                latency: Some(started.elapsed()),
                ..report
            };
            let previous = self.registry.health(&name).ok();
            let changed = previous.is_none_or(|p| p.state != report.state);
            let _ = self.registry.set_health(&name, report.clone());
            if changed {
                self.bus.publish(
                    Event::new(types::PLUGIN_HEALTH_CHANGED, "system").with_payload(
                        serde_json::json!({
                            "name": name,
                            "state": report.state,
                            "message": report.message,
                        }),
                    ),
                );
            }
        }
    }

    fn mark_failed(&self, name: &str, cause: &str) {
        let _ = self.registry.transition(name, Status::Failed);
        self.publish(types::PLUGIN_FAILED, name, Some(cause));
    }

    fn publish(&self, event_type: &str, name: &str, cause: Option<&str>) {
        let mut payload = serde_json::json!({ "name": name });
        if let Some(cause) = cause {
            payload["cause"] = serde_json::Value::String(cause.to_string());
        }
        self.bus
            .publish(Event::new(event_type, "system").with_payload(payload));
    }
}

impl LifecycleControl for LifecycleManager {
    fn statuses(&self) -> Vec<ComponentStatusInfo> {
        self.registry.statuses()
    }

    fn restart<'a>(
        &'a self,
        name: &'a str,
        cascade: bool,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(LifecycleManager::restart(self, name, cascade))
    }
}
