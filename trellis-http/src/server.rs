//! The HTTP transport server.
//!
//! Assembles application routes, the built-in health/metrics/admin
//! surfaces, and the pipeline layer, then serves each accepted connection
//! through hyper directly. Keepalive is enforced per connection: an idle
//! keep-alive connection times out waiting for the next request head,
//! `max_connection_age` triggers a graceful per-connection drain, and
//! HTTP/2 sessions ping on `ping_interval`. On shutdown the listener
//! stops accepting, in-flight requests get the configured drain window,
//! and whatever remains is aborted.

use std::time::Duration;

use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use trellis_core::config::sections::ServerConfig;
use trellis_core::Error;
use trellis_pipeline::Pipeline;

use crate::admin::{admin_router, AdminState};
use crate::health::{health_routes, HealthSource};
use crate::layer::PipelineLayer;

pub struct HttpServer {
    config: ServerConfig,
    pipeline: Pipeline,
    routes: Vec<Router>,
    health: HealthSource,
    admin: Option<AdminState>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, pipeline: Pipeline) -> Self {
        Self {
            config,
            pipeline,
            routes: Vec::new(),
            health: HealthSource::default(),
            admin: None,
        }
    }

    /// Merge application routes into the server.
    pub fn routes(mut self, router: Router) -> Self {
        self.routes.push(router);
        self
    }

    pub fn health_source(mut self, source: HealthSource) -> Self {
        self.health = source;
        self
    }

    /// Mount the admin API (`server.enable_admin` must also be set).
    pub fn admin(mut self, state: AdminState) -> Self {
        self.admin = Some(state);
        self
    }

    /// Build the final router with every built-in surface and the
    /// canonical chain wrapped around the whole thing.
    pub fn build(self) -> Router {
        let metrics = self.pipeline.metrics().clone();
        let mut router = Router::new()
            .merge(health_routes(self.health))
            .route(
                "/metrics",
                get(move || {
                    let metrics = metrics.clone();
                    async move {
                        (
                            [(
                                header::CONTENT_TYPE,
                                "text/plain; version=0.0.4; charset=utf-8",
                            )],
                            metrics.encode(),
                        )
                            .into_response()
                    }
                }),
            );
        for app_routes in self.routes {
            router = router.merge(app_routes);
        }
        if self.config.enable_admin {
            if let Some(admin) = self.admin {
                router = router.merge(admin_router(admin));
            }
        }
        router.layer(PipelineLayer::new(
            self.pipeline,
            self.config.request_timeout,
        ))
    }

    /// Bind and serve until `shutdown` fires, then drain. Returns whether
    /// all in-flight requests completed inside the drain window.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<bool, Error> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::unavailable(format!("bind {addr}: {e}")))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener (tests, pre-bound sockets).
    pub async fn serve_on(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<bool, Error> {
        let drain = self.config.drain_timeout;
        let idle_timeout = self.config.idle_timeout;
        let max_connection_age = self.config.max_connection_age;
        let ping_interval = self.config.ping_interval;
        let router = self.build();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "http server listening");
        }

        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "http connection accepted");
                            let service = TowerToHyperService::new(router.clone());
                            connections.spawn(serve_http_connection(
                                stream,
                                service,
                                idle_timeout,
                                max_connection_age,
                                ping_interval,
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => tracing::warn!(error = %e, "http accept failed"),
                    }
                }
            }
        }

        connections.close();
        let drained = tokio::time::timeout(drain, connections.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!("http server drained");
        } else {
            tracing::warn!("http drain deadline exceeded, aborting connections");
        }
        Ok(drained)
    }
}

/// Drive one connection to completion, enforcing the keepalive knobs.
///
/// `idle_timeout` bounds the wait for the next request head on a
/// keep-alive connection; `max_connection_age` gracefully drains the
/// connection once it has lived long enough; `ping_interval` becomes the
/// HTTP/2 keep-alive ping cadence.
async fn serve_http_connection(
    stream: tokio::net::TcpStream,
    service: TowerToHyperService<Router>,
    idle_timeout: Option<Duration>,
    max_connection_age: Option<Duration>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut builder = ConnectionBuilder::new(TokioExecutor::new());
    builder.http1().timer(TokioTimer::new());
    if let Some(idle) = idle_timeout {
        builder.http1().header_read_timeout(idle);
    }
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(ping_interval);
    if let Some(idle) = idle_timeout {
        builder.http2().keep_alive_timeout(idle);
    }

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);
    let age_deadline = max_connection_age.map(|age| tokio::time::Instant::now() + age);
    let mut draining = false;

    loop {
        let age_expired = async {
            match age_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "http connection ended with error");
                }
                return;
            }
            _ = shutdown.cancelled(), if !draining => {
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
            _ = age_expired, if !draining => {
                tracing::debug!("http connection reached max age, draining");
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    }
}
