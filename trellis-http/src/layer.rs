//! Tower layer installing the canonical chain over the whole router.
//!
//! One layer wraps everything: it builds the [`RequestContext`], hands the
//! inner router to the pipeline as "the handler", and shapes rejections
//! and failures into the envelope. Handlers see the context as a request
//! extension.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{header::HeaderName, HeaderValue, Request};
use axum::response::Response;
use tower::{Layer, Service};
use trellis_core::{Error, RequestContext, Transport};
use trellis_pipeline::Pipeline;

use crate::envelope::error_response;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

#[derive(Clone)]
pub struct PipelineLayer {
    pipeline: Pipeline,
    default_timeout: Option<Duration>,
}

impl PipelineLayer {
    pub fn new(pipeline: Pipeline, default_timeout: Option<Duration>) -> Self {
        Self {
            pipeline,
            default_timeout,
        }
    }
}

impl<S> Layer<S> for PipelineLayer {
    type Service = PipelineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PipelineService {
            inner,
            pipeline: self.pipeline.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

#[derive(Clone)]
pub struct PipelineService<S> {
    inner: S,
    pipeline: Pipeline,
    default_timeout: Option<Duration>,
}

impl<S> Service<Request<Body>> for PipelineService<S>
where
    S: Service<Request<Body>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let default_timeout = self.default_timeout;
        // Take the service readied by poll_ready, leave the clone behind.
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);

        Box::pin(async move {
            let method = req.method().to_string();
            let route = req
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| req.uri().path().to_string());

            let mut ctx = RequestContext::new(Transport::Http, method, route);
            if let Some(id) = header_str(&req, REQUEST_ID_HEADER) {
                ctx = ctx.with_request_id(id);
            }
            let requested_timeout = header_str(&req, TIMEOUT_HEADER)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis);
            ctx = ctx.with_deadline(default_timeout, requested_timeout);

            let mut carrier = HashMap::new();
            for key in ["traceparent", "tracestate"] {
                if let Some(value) = header_str(&req, key) {
                    carrier.insert(key.to_string(), value);
                }
            }

            let mut req = req;
            let dispatched = pipeline
                .dispatch(ctx, &carrier, move |ctx| async move {
                    req.extensions_mut().insert(ctx);
                    let response = match inner.call(req).await {
                        Ok(response) => response,
                        Err(never) => match never {},
                    };
                    // Typed handler failures ride the response extensions.
                    if let Some(error) = response.extensions().get::<Error>() {
                        return Err(error.clone());
                    }
                    Ok(response)
                })
                .await;

            let mut response = match dispatched.result {
                Ok(response) => response,
                Err(error) => error_response(&error, dispatched.trace_id.as_deref()),
            };

            set_header(&mut response, REQUEST_ID_HEADER, &dispatched.request_id);
            if let Some(trace_id) = &dispatched.trace_id {
                set_header(&mut response, TRACE_ID_HEADER, trace_id);
            }
            if let Some(rate) = dispatched.rate {
                set_header(&mut response, RATE_LIMIT_LIMIT, &format!("{}", rate.limit));
                set_header(
                    &mut response,
                    RATE_LIMIT_REMAINING,
                    &rate.remaining.to_string(),
                );
                set_header(&mut response, RATE_LIMIT_RESET, &rate.reset_at.to_string());
            }
            Ok(response)
        })
    }
}

fn header_str(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}
