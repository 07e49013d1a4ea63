use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use trellis_core::config::sections::{LogFormat, LoggerConfig, TracingConfig};

/// Assembled view of the `logger` and `tracing` config sections.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub tracing_enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub sample_ratio: f64,
}

impl TelemetryConfig {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            tracing_enabled: false,
            otlp_endpoint: None,
            sample_ratio: 1.0,
        }
    }

    pub fn from_sections(logger: &LoggerConfig, tracing: &TracingConfig) -> Self {
        Self {
            service_name: tracing.service_name.clone(),
            log_level: logger.level.clone(),
            log_format: logger.format,
            tracing_enabled: tracing.enabled,
            otlp_endpoint: tracing.endpoint.clone(),
            sample_ratio: tracing.sample_ratio,
        }
    }
}

/// Flushes pending spans on drop. Hold it for the life of the process.
pub struct OtelGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(provider) = &self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down span exporter: {e}");
            }
        }
    }
}

/// Install the global subscriber stack. Idempotent: a second call (tests,
/// embedded runtimes) leaves the existing subscriber in place.
pub fn init_telemetry(config: &TelemetryConfig) -> OtelGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let provider = config.tracing_enabled.then(|| {
        let resource = Resource::builder()
            .with_attributes([opentelemetry::KeyValue::new(
                opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                config.service_name.clone(),
            )])
            .build();
        let sampler = if config.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if config.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(config.sample_ratio)
        };
        let mut builder = SdkTracerProvider::builder()
            .with_sampler(sampler)
            .with_resource(resource);
        if let Some(endpoint) = &config.otlp_endpoint {
            use opentelemetry_otlp::WithExportConfig;
            match opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .build()
            {
                Ok(exporter) => builder = builder.with_batch_exporter(exporter),
                Err(e) => eprintln!("failed to build OTLP span exporter: {e}"),
            }
        }
        builder.build()
    });

    if let Some(provider) = &provider {
        crate::propagation::install_propagator();
        match config.log_format {
            LogFormat::Json => {
                let tracer = provider.tracer("trellis");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
                let _ = Registry::default()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init();
            }
            LogFormat::Text => {
                let tracer = provider.tracer("trellis");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
                let _ = Registry::default()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init();
            }
        }
    } else {
        match config.log_format {
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
                let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
            }
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
                let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
            }
        }
    }

    OtelGuard { provider }
}
