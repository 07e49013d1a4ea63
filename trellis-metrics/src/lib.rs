//! Request metrics shared by both transports.
//!
//! One counter and one histogram, labeled so that HTTP and RPC traffic
//! differ only in the `transport` label: `requests_total{transport,
//! resource, outcome}` and `request_duration_seconds{transport, resource}`,
//! plus an in-flight gauge. Exposition uses the Prometheus text format.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Outcome label for a successful request.
pub const OUTCOME_OK: &str = "ok";

#[derive(Clone)]
pub struct RequestMetrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
    in_flight: IntGauge,
}

impl RequestMetrics {
    pub fn new(namespace: &str) -> Self {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests by transport, resource and outcome")
                .namespace(namespace.to_string()),
            &["transport", "resource", "outcome"],
        )
        .expect("requests_total opts are static");
        let latency = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request latency")
                .namespace(namespace.to_string())
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["transport", "resource"],
        )
        .expect("request_duration_seconds opts are static");
        let in_flight = IntGauge::with_opts(
            Opts::new("requests_in_flight", "Requests currently being served")
                .namespace(namespace.to_string()),
        )
        .expect("requests_in_flight opts are static");

        registry
            .register(Box::new(requests.clone()))
            .expect("fresh registry");
        registry
            .register(Box::new(latency.clone()))
            .expect("fresh registry");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("fresh registry");

        Self {
            registry,
            requests,
            latency,
            in_flight,
        }
    }

    /// Record one finished request.
    pub fn observe(&self, transport: &str, resource: &str, outcome: &str, latency: Duration) {
        self.requests
            .with_label_values(&[transport, resource, outcome])
            .inc();
        self.latency
            .with_label_values(&[transport, resource])
            .observe(latency.as_secs_f64());
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.inc();
    }

    pub fn dec_in_flight(&self) {
        self.in_flight.dec();
    }

    /// Counter value for one label triple (admin snapshots, tests).
    pub fn request_count(&self, transport: &str, resource: &str, outcome: &str) -> u64 {
        self.requests
            .with_label_values(&[transport, resource, outcome])
            .get()
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new("trellis")
    }
}
