//! Trellis runtime core.
//!
//! The L0 layer of the runtime: configuration, the failure taxonomy, the
//! per-request context, and the component model with its registry. Higher
//! layers (events, protection, scheduler, transports, the lifecycle
//! manager) build on these types and never the other way around.

pub mod component;
pub mod config;
pub mod context;
pub mod error;

mod registry;

pub use component::{
    Component, ComponentContext, ComponentObject, ComponentStatusInfo, HealthReport, HealthState,
    LifecycleControl, Status,
};
pub use config::{Config, ConfigError};
pub use context::{RequestContext, Transport};
pub use error::{Error, Kind};
pub use registry::{ComponentRegistry, RegistryError};
