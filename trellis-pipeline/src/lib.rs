//! The canonical request chain, shared verbatim by both transports.
//!
//! Every inbound HTTP or RPC call runs [`Pipeline::dispatch`] with a
//! finalized [`RequestContext`] and an opaque handler. The chain order is
//! fixed: recovery barrier, start log, protection (rate limit before
//! breaker), tracing span, metrics, then the handler under its deadline.
//! The exit path unwinds in reverse: outcome recorded for the breaker,
//! span closed with the outcome, metrics observed, completion log emitted.
//! Because HTTP and RPC call the same code, span names, metric labels, and
//! log fields agree across transports modulo the transport prefix.

pub mod envelope;

pub use envelope::Envelope;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use opentelemetry::trace::TraceContextExt;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use std::sync::Arc;

use trellis_core::{Error, RequestContext};
use trellis_metrics::{RequestMetrics, OUTCOME_OK};
use trellis_observability::extract_parent;
use trellis_protection::{ProtectionEngine, WindowDecision};

/// Everything the transport needs to shape a response: the handler result,
/// the advisory rate-limit values, and the identifiers minted on the way.
pub struct Dispatched<T> {
    pub result: Result<T, Error>,
    pub rate: Option<WindowDecision>,
    pub request_id: String,
    pub trace_id: Option<String>,
    pub latency: Duration,
}

/// The shared chain. Cheap to clone; transports hold one each.
#[derive(Clone)]
pub struct Pipeline {
    protection: Arc<ProtectionEngine>,
    metrics: RequestMetrics,
}

impl Pipeline {
    pub fn new(protection: Arc<ProtectionEngine>, metrics: RequestMetrics) -> Self {
        Self {
            protection,
            metrics,
        }
    }

    pub fn protection(&self) -> &Arc<ProtectionEngine> {
        &self.protection
    }

    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Run one request through the chain.
    ///
    /// `carrier` holds the propagated trace context (HTTP headers or RPC
    /// envelope metadata) keyed by the W3C field names. The handler
    /// receives the context and must derive all downstream work from it.
    pub async fn dispatch<T, F, Fut>(
        &self,
        ctx: RequestContext,
        carrier: &HashMap<String, String>,
        handler: F,
    ) -> Dispatched<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>> + Send,
    {
        let transport = ctx.transport.as_str();
        let resource = ctx.resource();
        let request_id = ctx.request_id.clone();

        tracing::info!(
            transport,
            method = %ctx.method,
            route = %ctx.route,
            request_id = %request_id,
            "request started"
        );

        self.metrics.inc_in_flight();

        // Protection runs before the span opens: rejected traffic is
        // observed in metrics and logs but produces no trace.
        let permit = match self.protection.check(&resource) {
            Ok(permit) => permit,
            Err(denied) => {
                let rate = denied.rate;
                let error = denied.into_error();
                let latency = ctx.elapsed();
                self.finish_rejected(transport, &resource, &request_id, &error, latency);
                return Dispatched {
                    result: Err(error),
                    rate,
                    request_id,
                    trace_id: None,
                    latency,
                };
            }
        };
        let rate = permit.rate;

        let span = tracing::info_span!(
            "request",
            otel.name = %ctx.span_name(),
            transport,
            method = %ctx.method,
            route = %ctx.route,
            request_id = %request_id,
            outcome = tracing::field::Empty,
        );
        extract_parent(carrier, &span);
        let trace_id = {
            let context = span.context();
            let span_context = context.span().span_context().clone();
            span_context
                .is_valid()
                .then(|| span_context.trace_id().to_string())
        };

        let result = self
            .run_guarded(&ctx, handler)
            .instrument(span.clone())
            .await;

        let latency = ctx.elapsed();
        let outcome = match &result {
            Ok(_) => OUTCOME_OK,
            Err(e) => e.kind().as_str(),
        };
        span.record("outcome", outcome);

        // Exit path, reverse order: breaker accounting, metrics, log.
        self.protection
            .record(permit, result.as_ref().err().map(Error::kind), latency);
        self.metrics.observe(transport, &resource, outcome, latency);
        self.metrics.dec_in_flight();
        tracing::info!(
            transport,
            method = %ctx.method,
            route = %ctx.route,
            request_id = %request_id,
            outcome,
            latency_ms = latency.as_millis() as u64,
            "request completed"
        );

        Dispatched {
            result,
            rate,
            request_id,
            trace_id,
            latency,
        }
    }

    /// The innermost layers: recovery barrier, cancellation, deadline.
    async fn run_guarded<T, F, Fut>(&self, ctx: &RequestContext, handler: F) -> Result<T, Error>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>> + Send,
    {
        let cancel = ctx.cancellation().clone();
        let work = AssertUnwindSafe(handler(ctx.clone())).catch_unwind();

        let guarded = async {
            match work.await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(&panic);
                    tracing::error!(
                        request_id = %ctx.request_id,
                        panic = %message,
                        backtrace = %std::backtrace::Backtrace::force_capture(),
                        "handler panicked"
                    );
                    Err(Error::internal("internal error"))
                }
            }
        };

        match ctx.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::canceled("request canceled")),
                    _ = tokio::time::sleep_until(deadline) => {
                        cancel.cancel();
                        Err(Error::deadline_exceeded("request deadline exceeded"))
                    }
                    result = guarded => result,
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::canceled("request canceled")),
                    result = guarded => result,
                }
            }
        }
    }

    fn finish_rejected(
        &self,
        transport: &str,
        resource: &str,
        request_id: &str,
        error: &Error,
        latency: Duration,
    ) {
        let outcome = error.kind().as_str();
        self.metrics.observe(transport, resource, outcome, latency);
        self.metrics.dec_in_flight();
        tracing::info!(
            transport,
            resource,
            request_id,
            outcome,
            latency_ms = latency.as_millis() as u64,
            "request rejected"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{Kind, Transport};
    use trellis_protection::{ProtectionConfig, RateLimitRule};

    fn pipeline_with(rate: Vec<RateLimitRule>) -> Pipeline {
        let mut config = ProtectionConfig::default();
        config.enabled = true;
        config.rate_limit_rules = rate;
        Pipeline::new(
            Arc::new(ProtectionEngine::new(config)),
            RequestMetrics::new("pipeline_test"),
        )
    }

    fn ctx(route: &str) -> RequestContext {
        RequestContext::new(Transport::Http, "GET", route)
    }

    #[tokio::test]
    async fn success_flows_through() {
        let pipeline = pipeline_with(vec![]);
        let dispatched = pipeline
            .dispatch(ctx("/ok"), &HashMap::new(), |_ctx| async { Ok(42u32) })
            .await;
        assert_eq!(dispatched.result.unwrap(), 42);
        assert_eq!(
            pipeline.metrics().request_count("http", "http:GET:/ok", OUTCOME_OK),
            1
        );
    }

    #[tokio::test]
    async fn handler_error_passes_back_unchanged() {
        let pipeline = pipeline_with(vec![]);
        let dispatched = pipeline
            .dispatch(ctx("/missing"), &HashMap::new(), |_ctx| async {
                Err::<(), _>(Error::not_found("nope"))
            })
            .await;
        let err = dispatched.result.unwrap_err();
        assert_eq!(err.kind(), Kind::NotFound);
        assert_eq!(err.message(), "nope");
    }

    #[tokio::test]
    async fn panic_becomes_internal() {
        let pipeline = pipeline_with(vec![]);
        let dispatched = pipeline
            .dispatch(ctx("/boom"), &HashMap::new(), |_ctx| async {
                panic!("kaboom");
                #[allow(unreachable_code)]
                Ok(())
            })
            .await;
        assert_eq!(dispatched.result.unwrap_err().kind(), Kind::Internal);
        assert_eq!(
            pipeline
                .metrics()
                .request_count("http", "http:GET:/boom", "internal"),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_produces_deadline_exceeded() {
        let pipeline = pipeline_with(vec![]);
        let ctx = ctx("/slow").with_deadline(Some(Duration::from_millis(50)), None);
        let dispatched = pipeline
            .dispatch(ctx, &HashMap::new(), |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(
            dispatched.result.unwrap_err().kind(),
            Kind::DeadlineExceeded
        );
    }

    #[tokio::test]
    async fn cancellation_is_recorded_distinctly() {
        let pipeline = pipeline_with(vec![]);
        let ctx = ctx("/canceled");
        let cancel = ctx.cancellation().clone();
        let dispatched = pipeline
            .dispatch(ctx, &HashMap::new(), move |_ctx| async move {
                cancel.cancel();
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;
        assert_eq!(dispatched.result.unwrap_err().kind(), Kind::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requests_never_reach_the_handler() {
        let pipeline = pipeline_with(vec![RateLimitRule {
            name: "tight".into(),
            resource: "http:GET:/limited".into(),
            threshold: 1.0,
            stat_interval_ms: 1_000,
            enabled: true,
            description: None,
        }]);

        let first = pipeline
            .dispatch(ctx("/limited"), &HashMap::new(), |_ctx| async { Ok(()) })
            .await;
        assert!(first.result.is_ok());
        assert_eq!(first.rate.unwrap().remaining, 0);

        let handler_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = handler_ran.clone();
        let second = pipeline
            .dispatch(ctx("/limited"), &HashMap::new(), move |_ctx| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(second.result.unwrap_err().kind(), Kind::RateLimited);
        assert!(!handler_ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(second.rate.unwrap().remaining, 0);
    }
}
