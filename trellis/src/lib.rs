//! Trellis — a distributed service runtime.
//!
//! One process hosting HTTP and RPC endpoints over a dependency-ordered
//! component lifecycle, with inline protection (rate limits + circuit
//! breakers), a cron/interval/once scheduler, and an in-process event bus
//! tying it together. This facade crate re-exports the member crates and
//! provides the [`Framework`] assembly plus signal-driven shutdown.

pub mod framework;
pub mod lifecycle;
pub mod registrar;

pub use framework::{Framework, FrameworkBuilder};
pub use lifecycle::LifecycleManager;
pub use registrar::{NoopRegistrar, Registrar, ServiceInfo};

pub use trellis_core as core;
pub use trellis_events as events;
pub use trellis_http as http;
pub use trellis_metrics as metrics;
pub use trellis_observability as observability;
pub use trellis_pipeline as pipeline;
pub use trellis_protection as protection;
pub use trellis_rpc as rpc;
pub use trellis_scheduler as scheduler;

/// The types most services need, in one import.
pub mod prelude {
    pub use crate::framework::Framework;
    pub use crate::registrar::{Registrar, ServiceInfo};
    pub use trellis_core::{
        Component, ComponentContext, Config, Error, HealthReport, Kind, RequestContext, Transport,
    };
    pub use trellis_events::{Event, EventBus};
    pub use trellis_http::{Api, ApiError, ApiResult, Ctx, Envelope};
    pub use trellis_scheduler::{Schedule, TaskSpec};
}
