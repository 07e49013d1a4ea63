//! Fluent assembly of the runtime and its signal-driven shutdown.
//!
//! ```ignore
//! let exit = Framework::builder()
//!     .config(Config::load()?)
//!     .component(Arc::new(CacheComponent::new()))
//!     .routes(user_routes())
//!     .rpc(|registry| {
//!         registry.unary("user.get", get_user);
//!     })
//!     .task(TaskSpec::new("cleanup", Schedule::cron("0 3 * * *")?, cleanup))
//!     .build()?
//!     .run()
//!     .await;
//! std::process::exit(exit);
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use trellis_core::config::sections::{
    ConsulConfig, JwtConfig, LoggerConfig, MetricsConfig, MysqlConfig, RabbitmqConfig,
    RedisConfig, RpcConfig, Section, ServerConfig, TracingConfig,
};
use trellis_core::{ComponentObject, ComponentRegistry, Config, Error};
use trellis_events::{types, Event, EventBus};
use trellis_http::{AdminState, HealthSource, HttpServer};
use trellis_metrics::RequestMetrics;
use trellis_observability::{init_telemetry, OtelGuard, TelemetryConfig};
use trellis_pipeline::Pipeline;
use trellis_protection::{ProtectionConfig, ProtectionEngine, WindowStore};
use trellis_rpc::{MethodRegistry, RpcServer};
use trellis_scheduler::{Scheduler, TaskSpec};

use crate::lifecycle::LifecycleManager;
use crate::registrar::{NoopRegistrar, Registrar, ServiceInfo};

type RpcSetup = Box<dyn FnOnce(&MethodRegistry) + Send>;

pub struct FrameworkBuilder {
    config: Option<Config>,
    service_name: String,
    components: Vec<Arc<dyn ComponentObject>>,
    routes: Vec<axum::Router>,
    rpc_setup: Vec<RpcSetup>,
    tasks: Vec<TaskSpec>,
    registrar: Arc<dyn Registrar>,
    shared_store: Option<Arc<dyn WindowStore>>,
}

impl FrameworkBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Register a component; dependencies must be registered first.
    pub fn component(mut self, component: Arc<dyn ComponentObject>) -> Self {
        self.components.push(component);
        self
    }

    /// Merge application HTTP routes.
    pub fn routes(mut self, router: axum::Router) -> Self {
        self.routes.push(router);
        self
    }

    /// Register RPC methods once the server exists.
    pub fn rpc<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(&MethodRegistry) + Send + 'static,
    {
        self.rpc_setup.push(Box::new(setup));
        self
    }

    /// Schedule a task at startup.
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = registrar;
        self
    }

    /// Back the rate limiter with a shared (remote) window store.
    pub fn protection_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Framework, Error> {
        let config = match self.config {
            Some(config) => config,
            None => Config::load().map_err(|e| Error::invalid_argument(e.to_string()))?,
        };

        // Section decoding front-loads every config failure to startup,
        // adapter sections included.
        let server = ServerConfig::load(&config).map_err(config_error)?;
        let rpc = RpcConfig::load_with_alias(&config).map_err(config_error)?;
        let logger = LoggerConfig::load(&config)
            .map_err(config_error)?
            .unwrap_or_default();
        let tracing_section = TracingConfig::load(&config)
            .map_err(config_error)?
            .unwrap_or_default();
        let metrics_section = MetricsConfig::load(&config)
            .map_err(config_error)?
            .unwrap_or_default();
        let consul = ConsulConfig::load(&config).map_err(config_error)?;
        JwtConfig::load(&config).map_err(config_error)?;
        MysqlConfig::load(&config).map_err(config_error)?;
        RedisConfig::load(&config).map_err(config_error)?;
        RabbitmqConfig::load(&config).map_err(config_error)?;
        let protection = ProtectionConfig::load(&config).map_err(config_error)?;

        let telemetry = TelemetryConfig::from_sections(&logger, &tracing_section);
        let guard = init_telemetry(&telemetry);

        let config = Arc::new(config);
        let bus = EventBus::new();
        let registry = Arc::new(ComponentRegistry::new());
        for component in self.components {
            let name = component.name().to_string();
            registry
                .register(component)
                .map_err(|e| Error::invalid_argument(e.to_string()))?;
            bus.publish(
                Event::new(types::PLUGIN_LOADED, "system")
                    .with_payload(serde_json::json!({ "name": name })),
            );
        }

        let engine = Arc::new(match self.shared_store {
            Some(store) => ProtectionEngine::with_store(protection, store),
            None => ProtectionEngine::new(protection),
        });
        let metrics = RequestMetrics::new(&metrics_section.namespace);
        let pipeline = Pipeline::new(engine.clone(), metrics);
        let scheduler = Scheduler::new(bus.clone());
        let lifecycle = Arc::new(LifecycleManager::new(
            registry,
            bus.clone(),
            config.clone(),
        ));

        Ok(Framework {
            config,
            service_name: self.service_name,
            server,
            rpc,
            consul,
            bus,
            engine,
            pipeline,
            scheduler,
            lifecycle,
            routes: self.routes,
            rpc_setup: self.rpc_setup,
            tasks: self.tasks,
            registrar: self.registrar,
            _telemetry: guard,
        })
    }
}

fn config_error(e: trellis_core::ConfigError) -> Error {
    Error::invalid_argument(e.to_string())
}

pub struct Framework {
    config: Arc<Config>,
    service_name: String,
    server: Option<ServerConfig>,
    rpc: Option<RpcConfig>,
    consul: Option<ConsulConfig>,
    bus: EventBus,
    engine: Arc<ProtectionEngine>,
    pipeline: Pipeline,
    scheduler: Scheduler,
    lifecycle: Arc<LifecycleManager>,
    routes: Vec<axum::Router>,
    rpc_setup: Vec<RpcSetup>,
    tasks: Vec<TaskSpec>,
    registrar: Arc<dyn Registrar>,
    _telemetry: OtelGuard,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

impl Framework {
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder {
            config: None,
            service_name: "trellis".to_string(),
            components: Vec::new(),
            routes: Vec::new(),
            rpc_setup: Vec::new(),
            tasks: Vec::new(),
            registrar: Arc::new(NoopRegistrar),
            shared_store: None,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn protection(&self) -> &Arc<ProtectionEngine> {
        &self.engine
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Run until SIGINT/SIGTERM; SIGHUP reloads protection rules from the
    /// config source. Returns the process exit code.
    pub async fn run(self) -> i32 {
        let shutdown = CancellationToken::new();
        spawn_signal_handlers(
            shutdown.clone(),
            self.engine.clone(),
            self.config.env().to_string(),
        );
        self.run_until(shutdown).await
    }

    /// Run until `shutdown` fires, then execute the ordered drain:
    /// deregister, stop scheduler, close transports, stop components,
    /// flush telemetry. Exit code 0 when every stage drained in time.
    pub async fn run_until(self, shutdown: CancellationToken) -> i32 {
        let internal = CancellationToken::new();
        self.engine.start_cleanup(internal.child_token());

        if let Err(e) = self.lifecycle.init_all().await {
            tracing::error!(error = %e, "component initialization failed");
            return 1;
        }
        if let Err(e) = self.lifecycle.start_all().await {
            tracing::error!(error = %e, "component startup failed");
            return 1;
        }
        self.lifecycle.spawn_health_poller(internal.child_token());

        self.scheduler.start();
        for task in self.tasks {
            let name = task.name.clone();
            if let Err(e) = self.scheduler.schedule(task) {
                tracing::error!(task = %name, error = %e, "failed to schedule task");
            }
        }

        // Transports get their own tokens so the shutdown sequence can
        // close them at the right stage, after the scheduler.
        let http_token = CancellationToken::new();
        let http_handle = self.server.map(|server_config| {
            let admin = AdminState::new(self.engine.clone())
                .with_scheduler(self.scheduler.clone())
                .with_lifecycle(self.lifecycle.clone() as _);
            let mut server = HttpServer::new(server_config, self.pipeline.clone())
                .health_source(HealthSource::new(self.lifecycle.clone() as _))
                .admin(admin);
            for routes in self.routes {
                server = server.routes(routes);
            }
            let token = http_token.clone();
            tokio::spawn(server.serve(token))
        });

        let rpc_token = CancellationToken::new();
        let rpc_handle = self.rpc.map(|rpc_config| {
            let server = RpcServer::new(rpc_config, self.pipeline.clone());
            for setup in self.rpc_setup {
                setup(server.registry());
            }
            let token = rpc_token.clone();
            tokio::spawn(server.serve(token))
        });
        if http_handle.is_none() && rpc_handle.is_none() {
            tracing::warn!("no transport configured; running components and scheduler only");
        }

        let service_info = self.consul.as_ref().filter(|c| c.enabled).map(|consul| {
            let port = self.config.get_or("server.port", 0u16);
            ServiceInfo::from_config(&self.service_name, port, consul, &self.config)
        });
        if let Some(info) = &service_info {
            if let Err(e) = self.registrar.register(info).await {
                tracing::warn!(error = %e, "service registration failed");
            }
        }

        self.bus.publish(Event::new(types::SYSTEM_STARTED, "system"));
        tracing::info!(service = %self.service_name, env = %self.config.env(), "runtime started");

        shutdown.cancelled().await;
        tracing::info!("shutdown signal received");

        // 1. Leave the service registry.
        if service_info.is_some() {
            if let Err(e) = self.registrar.deregister().await {
                tracing::warn!(error = %e, "service deregistration failed");
            }
        }

        // 2. Stop the scheduler, draining in-flight tasks.
        let drain = self
            .config
            .get_or("server.drain_timeout", std::time::Duration::from_secs(5));
        let mut clean = self.scheduler.shutdown(drain).await;

        // 3. Close the transports: stop accepting, drain in-flight.
        http_token.cancel();
        rpc_token.cancel();
        if let Some(handle) = http_handle {
            clean &= matches!(handle.await, Ok(Ok(true)));
        }
        if let Some(handle) = rpc_handle {
            clean &= matches!(handle.await, Ok(Ok(true)));
        }

        // 4. Stop components in reverse dependency order.
        if let Err(e) = self.lifecycle.stop_all().await {
            tracing::error!(error = %e, "component stop failed");
            clean = false;
        }

        internal.cancel();
        if !clean {
            self.bus
                .publish(Event::new(types::SHUTDOWN_FORCE, "system"));
        }
        self.bus.publish(Event::new(types::SYSTEM_STOPPED, "system"));
        // Give queued bus deliveries a moment to drain before teardown.
        tokio::task::yield_now().await;
        self.bus.close();

        // 5. Telemetry flushes when the guard drops on return.
        if clean {
            0
        } else {
            1
        }
    }
}

fn spawn_signal_handlers(shutdown: CancellationToken, engine: Arc<ProtectionEngine>, env: String) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut sigint =
                signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
            loop {
                tokio::select! {
                    _ = sigint.recv() => {
                        tracing::info!("SIGINT received");
                        shutdown.cancel();
                        break;
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("SIGTERM received");
                        shutdown.cancel();
                        break;
                    }
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received, reloading protection rules");
                        reload_protection(&engine, &env);
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (engine, env);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }
}

#[cfg(unix)]
fn reload_protection(engine: &Arc<ProtectionEngine>, env: &str) {
    let loaded = Config::load_from_dir(std::path::Path::new("."), env)
        .and_then(|config| ProtectionConfig::load(&config));
    match loaded {
        Ok(protection) => {
            if let Err(e) = engine.reload(protection) {
                tracing::error!(error = %e, "protection rule reload rejected");
            }
        }
        Err(e) => tracing::error!(error = %e, "config reload failed"),
    }
}
