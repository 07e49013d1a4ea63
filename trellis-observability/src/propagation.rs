//! W3C trace-context propagation over a plain string map.
//!
//! Both transports funnel their carrier (HTTP headers, RPC envelope
//! metadata) into a `HashMap<String, String>`, which keeps span parentage
//! identical across them.

use std::collections::HashMap;

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Install the global W3C `traceparent` propagator. Must run before any
/// extraction or injection.
pub fn install_propagator() {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
}

struct MapCarrier<'a>(&'a mut HashMap<String, String>);

impl Injector for MapCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct MapReader<'a>(&'a HashMap<String, String>);

impl Extractor for MapReader<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Inject the current span's context into `carrier` (outbound calls).
pub fn inject_current(carrier: &mut HashMap<String, String>) {
    let context = tracing::Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut MapCarrier(carrier));
    });
}

/// Extract a propagated parent context and attach it to `span`. A carrier
/// with no `traceparent` leaves the span a root.
pub fn extract_parent(carrier: &HashMap<String, String>, span: &tracing::Span) {
    let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&MapReader(carrier))
    });
    span.set_parent(parent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_traceparent() {
        install_propagator();
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );
        let span = tracing::info_span!("probe");
        extract_parent(&carrier, &span);

        let mut out = HashMap::new();
        let _guard = span.enter();
        inject_current(&mut out);
        // With no subscriber installed the context may be empty; the call
        // must not panic either way.
        let _ = out.get("traceparent");
    }
}
