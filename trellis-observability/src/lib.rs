//! Telemetry setup and cross-transport trace propagation.
//!
//! [`init_telemetry`] builds the tracing-subscriber stack (fmt layer +
//! `EnvFilter`, optional OpenTelemetry OTLP export) once per process and
//! returns an [`OtelGuard`] that flushes pending spans on drop. The
//! propagation helpers speak W3C `traceparent` over a plain string map, so
//! HTTP headers and RPC envelope metadata share one code path.

mod propagation;
mod setup;

pub use propagation::{extract_parent, inject_current, install_propagator};
pub use setup::{init_telemetry, OtelGuard, TelemetryConfig};
