//! Service-registry capability.
//!
//! The concrete registry client (consul or otherwise) lives outside the
//! core; what the runtime needs is register-on-start and
//! deregister-on-shutdown, with reconnect/backoff handled inside the
//! adapter. The default is a no-op for standalone deployments.

use std::future::Future;
use std::pin::Pin;

use trellis_core::{Config, Error};
use trellis_core::config::sections::ConsulConfig;

/// What the runtime advertises to a service registry.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl ServiceInfo {
    /// Resolve the advertised address from the consul section: container
    /// name in production, localhost in development.
    pub fn from_config(name: &str, port: u16, consul: &ConsulConfig, config: &Config) -> Self {
        Self {
            name: consul
                .service_name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            address: consul.advertised_host(config),
            port,
        }
    }
}

pub trait Registrar: Send + Sync {
    fn register<'a>(
        &'a self,
        info: &'a ServiceInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

    fn deregister(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
}

/// Standalone deployments register nowhere.
#[derive(Default)]
pub struct NoopRegistrar;

impl Registrar for NoopRegistrar {
    fn register<'a>(
        &'a self,
        info: &'a ServiceInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            tracing::debug!(service = %info.name, "no service registry configured");
            Ok(())
        })
    }

    fn deregister(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
