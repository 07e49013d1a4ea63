//! The RPC transport server: TCP accept loop, per-connection framing,
//! and per-request dispatch through the canonical chain.
//!
//! Request payloads are JSON `{method, data?, metadata?}`; responses wrap
//! the shared envelope plus an `eos` marker on the final frame of a call.
//! Keepalive: an idle connection times out, `max_connection_age` drains
//! and closes long-lived connections, inbound `sys.ping` requests are
//! answered in place without touching the method registry, and the server
//! itself emits a `sys.ping` once a connection has been quiet for
//! `ping_interval`.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use trellis_core::config::sections::RpcConfig;
use trellis_core::{Error, RequestContext, Transport};
use trellis_pipeline::{Envelope, Pipeline};

use crate::frame::{Frame, FrameCodec, FrameType};
use crate::registry::{dispatch_method, MethodRegistry, RpcReply};

/// Reserved method answered inline by the connection loop.
pub const PING_METHOD: &str = "sys.ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The three advisory values a rate-limit rule attaches to responses,
/// the RPC counterpart of the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateAdvisory {
    pub limit: f64,
    pub remaining: u64,
    /// Absolute Unix second at which the window resets.
    pub reset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Marks the final frame of a call; streaming replies send it on a
    /// trailing empty envelope.
    #[serde(default, skip_serializing_if = "is_false")]
    pub eos: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateAdvisory>,
}

impl RpcResponse {
    fn final_frame(envelope: Envelope) -> Self {
        Self {
            envelope,
            eos: true,
            rate_limit: None,
        }
    }

    fn stream_item(envelope: Envelope) -> Self {
        Self {
            envelope,
            eos: false,
            rate_limit: None,
        }
    }

    fn with_rate(mut self, rate: Option<trellis_protection::WindowDecision>) -> Self {
        self.rate_limit = rate.map(|r| RateAdvisory {
            limit: r.limit,
            remaining: r.remaining,
            reset: r.reset_at,
        });
        self
    }

    fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("response envelope serializes"))
    }
}

pub struct RpcServer {
    config: RpcConfig,
    pipeline: Pipeline,
    registry: MethodRegistry,
}

impl RpcServer {
    pub fn new(config: RpcConfig, pipeline: Pipeline) -> Self {
        Self {
            config,
            pipeline,
            registry: MethodRegistry::new(),
        }
    }

    /// The method table; register services before calling `serve`.
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Bind and serve until `shutdown` fires, then drain connections up to
    /// the configured window. Returns whether the drain completed.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<bool, Error> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::unavailable(format!("bind {addr}: {e}")))?;
        self.serve_on(listener, shutdown).await
    }

    pub async fn serve_on(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<bool, Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "rpc server listening");
        }
        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "rpc connection accepted");
                            let config = self.config.clone();
                            let pipeline = self.pipeline.clone();
                            let registry = self.registry.clone();
                            let shutdown = shutdown.clone();
                            connections.spawn(async move {
                                serve_connection(config, pipeline, registry, stream, shutdown)
                                    .await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "rpc accept failed"),
                    }
                }
            }
        }

        connections.close();
        let drained = tokio::time::timeout(self.config.drain_timeout, connections.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!("rpc server drained");
        } else {
            tracing::warn!("rpc drain deadline exceeded, aborting connections");
        }
        Ok(drained)
    }
}

/// Drive one connection: read request frames, answer pings inline, spawn
/// dispatches, and fan responses back through a single writer.
pub async fn serve_connection<S>(
    config: RpcConfig,
    pipeline: Pipeline,
    registry: MethodRegistry,
    stream: S,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let framed = Framed::new(stream, FrameCodec::new(config.max_frame_bytes));
    let (mut sink, mut frames) = framed.split();

    let (tx, mut rx) = mpsc::channel::<Frame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let age_deadline = config.max_connection_age.map(|age| Instant::now() + age);
    let requests = TaskTracker::new();
    let mut last_frame = Instant::now();
    let mut next_ping = last_frame + config.ping_interval;

    loop {
        let age_expired = async {
            match age_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = age_expired => {
                tracing::debug!("rpc connection reached max age, draining");
                break;
            }
            _ = tokio::time::sleep_until(last_frame + config.idle_timeout) => {
                tracing::debug!("rpc connection idle timeout");
                break;
            }
            _ = tokio::time::sleep_until(next_ping) => {
                // Keepalive: probe a quiet connection. The peer's pong (or
                // any other frame) resets the idle clock above.
                let ping = RpcRequest {
                    method: PING_METHOD.to_string(),
                    data: serde_json::Value::Null,
                    metadata: HashMap::new(),
                };
                let payload = Bytes::from(
                    serde_json::to_vec(&ping).expect("ping envelope serializes"),
                );
                if tx.send(Frame::request(0, payload)).await.is_err() {
                    break;
                }
                next_ping = Instant::now() + config.ping_interval;
            }
            frame = frames.next() => {
                last_frame = Instant::now();
                next_ping = last_frame + config.ping_interval;
                let frame = match frame {
                    None => break,
                    Some(Err(e)) => {
                        let envelope = Envelope::failure(&e, None);
                        let _ = tx
                            .send(Frame::error(0, RpcResponse::final_frame(envelope).to_bytes()))
                            .await;
                        break;
                    }
                    Some(Ok(frame)) => frame,
                };
                if frame.frame_type != FrameType::Request {
                    // Pongs for our keepalive pings land here.
                    tracing::debug!(?frame.frame_type, "ignoring non-request frame");
                    continue;
                }
                handle_request(&config, &pipeline, &registry, &requests, &tx, frame);
            }
        }
    }

    // Finish in-flight dispatches, then let the writer flush and close.
    requests.close();
    requests.wait().await;
    drop(tx);
    let _ = writer.await;
}

fn handle_request(
    config: &RpcConfig,
    pipeline: &Pipeline,
    registry: &MethodRegistry,
    requests: &TaskTracker,
    tx: &mpsc::Sender<Frame>,
    frame: Frame,
) {
    let correlation_id = frame.correlation_id;
    let request: RpcRequest = match serde_json::from_slice(&frame.payload) {
        Ok(request) => request,
        Err(e) => {
            let error = Error::invalid_argument(format!("request payload: {e}"));
            let envelope = Envelope::failure(&error, None);
            let tx = tx.clone();
            requests.spawn(async move {
                let _ = tx
                    .send(Frame::error(
                        correlation_id,
                        RpcResponse::final_frame(envelope).to_bytes(),
                    ))
                    .await;
            });
            return;
        }
    };

    if request.method == PING_METHOD {
        let tx = tx.clone();
        requests.spawn(async move {
            let envelope = Envelope {
                code: 0,
                message: "pong".to_string(),
                data: None,
                trace_id: None,
            };
            let _ = tx
                .send(Frame::response(
                    correlation_id,
                    RpcResponse::final_frame(envelope).to_bytes(),
                ))
                .await;
        });
        return;
    }

    let pipeline = pipeline.clone();
    let registry = registry.clone();
    let tx = tx.clone();
    let default_timeout = config.request_timeout;
    requests.spawn(async move {
        let mut ctx = RequestContext::new(
            Transport::Rpc,
            request.method.clone(),
            request.method.clone(),
        )
        .with_correlation_id(correlation_id.to_string());
        if let Some(id) = request.metadata.get("x-request-id") {
            ctx = ctx.with_request_id(id.clone());
        }
        let requested_timeout = request
            .metadata
            .get("timeout_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        ctx = ctx.with_deadline(default_timeout, requested_timeout);

        let method = request.method.clone();
        let data = request.data.clone();
        let dispatched = pipeline
            .dispatch(ctx, &request.metadata, move |ctx| {
                dispatch_method(&registry, ctx, &method, data)
            })
            .await;
        let trace_id = dispatched.trace_id;
        let rate = dispatched.rate;

        match dispatched.result {
            Err(error) => {
                let envelope = Envelope::failure(&error, trace_id.as_deref());
                let _ = tx
                    .send(Frame::error(
                        correlation_id,
                        RpcResponse::final_frame(envelope).with_rate(rate).to_bytes(),
                    ))
                    .await;
            }
            Ok(RpcReply::Unary(value)) => {
                let mut envelope = Envelope::ok(value);
                envelope.trace_id = trace_id;
                let _ = tx
                    .send(Frame::response(
                        correlation_id,
                        RpcResponse::final_frame(envelope).with_rate(rate).to_bytes(),
                    ))
                    .await;
            }
            Ok(RpcReply::Stream(mut stream)) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            let envelope = Envelope::ok(value);
                            if tx
                                .send(Frame::response(
                                    correlation_id,
                                    RpcResponse::stream_item(envelope).to_bytes(),
                                ))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(error) => {
                            let envelope = Envelope::failure(&error, trace_id.as_deref());
                            let _ = tx
                                .send(Frame::error(
                                    correlation_id,
                                    RpcResponse::final_frame(envelope).to_bytes(),
                                ))
                                .await;
                            return;
                        }
                    }
                }
                let envelope = Envelope {
                    code: 0,
                    message: "OK".to_string(),
                    data: None,
                    trace_id,
                };
                let _ = tx
                    .send(Frame::response(
                        correlation_id,
                        RpcResponse::final_frame(envelope).to_bytes(),
                    ))
                    .await;
            }
        }
    });
}
