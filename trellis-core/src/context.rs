//! Per-request context threaded through the canonical middleware chain.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which transport a request arrived on. Fixes the resource-key prefix,
/// the span-name prefix, and the `transport` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Http,
    Rpc,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Rpc => "rpc",
        }
    }
}

/// The per-request value bag. Exactly one exists per in-flight request;
/// handlers must derive every downstream call from it so deadlines and
/// cancellation cascade.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub transport: Transport,
    /// HTTP method, or the RPC frame's `service.method` string.
    pub method: String,
    /// Matched route pattern (`/users/{id}`), or the RPC method name.
    pub route: String,
    pub started_at: Instant,
    pub deadline: Option<Instant>,
    pub correlation_id: Option<String>,
    /// Caller identity, filled in by auth middleware when present.
    pub caller: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Build a context for an inbound request. `request_id` comes from the
    /// transport header when the caller supplied one; otherwise mint one.
    pub fn new(transport: Transport, method: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            transport,
            method: method.into(),
            route: route.into(),
            started_at: Instant::now(),
            deadline: None,
            correlation_id: None,
            caller: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Apply the effective deadline: `min(configured default, caller's)`.
    pub fn with_deadline(mut self, configured: Option<Duration>, requested: Option<Duration>) -> Self {
        let effective = match (configured, requested) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        self.deadline = effective.map(|d| self.started_at + d);
        self
    }

    /// The protection resource key for this request:
    /// `http:{METHOD}:{route}` or `rpc:{service.method}`.
    pub fn resource(&self) -> String {
        match self.transport {
            Transport::Http => format!("http:{}:{}", self.method, self.route),
            Transport::Rpc => format!("rpc:{}", self.method),
        }
    }

    /// Span name: identical across transports modulo the prefix.
    pub fn span_name(&self) -> String {
        match self.transport {
            Transport::Http => format!("http.{} {}", self.method, self.route),
            Transport::Rpc => format!("rpc.{}", self.method),
        }
    }

    /// Remaining budget until the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The cancellation signal for this request. Child operations should
    /// clone this token (or a child of it) and poll it at I/O boundaries.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_resource_key_includes_method_and_route() {
        let ctx = RequestContext::new(Transport::Http, "GET", "/users/{id}");
        assert_eq!(ctx.resource(), "http:GET:/users/{id}");
    }

    #[test]
    fn rpc_resource_key_uses_method_only() {
        let ctx = RequestContext::new(Transport::Rpc, "user.get", "user.get");
        assert_eq!(ctx.resource(), "rpc:user.get");
    }

    #[test]
    fn minted_request_ids_are_unique() {
        let a = RequestContext::new(Transport::Http, "GET", "/");
        let b = RequestContext::new(Transport::Http, "GET", "/");
        assert_ne!(a.request_id, b.request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_takes_minimum_of_configured_and_requested() {
        let ctx = RequestContext::new(Transport::Http, "GET", "/slow").with_deadline(
            Some(Duration::from_secs(30)),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ctx.deadline_elapsed());
    }

    #[tokio::test]
    async fn cancellation_is_observable() {
        let ctx = RequestContext::new(Transport::Rpc, "user.list", "user.list");
        assert!(!ctx.is_canceled());
        ctx.cancel();
        assert!(ctx.is_canceled());
        ctx.cancellation().cancelled().await;
    }
}
