use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use trellis_core::config::sections::{RpcConfig, Section};
use trellis_core::{Config, Error};
use trellis_metrics::RequestMetrics;
use trellis_pipeline::Pipeline;
use trellis_protection::{ProtectionConfig, ProtectionEngine, RateLimitRule};
use trellis_rpc::{
    serve_connection, Frame, FrameCodec, FrameType, MethodRegistry, RpcRequest, RpcResponse,
    PING_METHOD,
};

fn rpc_config() -> RpcConfig {
    let yaml = "rpc:\n  port: 0\n  idle_timeout: 60s\n";
    RpcConfig::load(&Config::from_yaml_str(yaml, "test").unwrap())
        .unwrap()
        .unwrap()
}

fn pipeline(rate: Vec<RateLimitRule>) -> Pipeline {
    let mut config = ProtectionConfig::default();
    config.enabled = true;
    config.rate_limit_rules = rate;
    Pipeline::new(
        Arc::new(ProtectionEngine::new(config)),
        RequestMetrics::new("rpc_test"),
    )
}

fn test_registry() -> MethodRegistry {
    let registry = MethodRegistry::new();
    registry.unary("user.get", |_ctx, input: serde_json::Value| async move {
        let id = input["id"].as_u64().unwrap_or(0);
        if id == 404 {
            return Err(Error::not_found("user 404 does not exist"));
        }
        Ok(serde_json::json!({ "id": id, "name": "ada" }))
    });
    registry.streaming("user.watch", |_ctx, count: serde_json::Value| async move {
        let n = count["n"].as_u64().unwrap_or(3);
        let stream = futures_util::stream::iter(
            (0..n).map(|i| Ok(serde_json::json!({ "seq": i }))),
        );
        Ok(Box::pin(stream) as trellis_rpc::ValueStream)
    });
    registry
}

/// Spin up a server loop on one end of a duplex pipe, return a framed
/// client on the other.
fn connect(
    rate: Vec<RateLimitRule>,
) -> (
    Framed<tokio::io::DuplexStream, FrameCodec>,
    CancellationToken,
) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let shutdown = CancellationToken::new();
    let config = rpc_config();
    let max_frame = config.max_frame_bytes;
    tokio::spawn(serve_connection(
        config,
        pipeline(rate),
        test_registry(),
        server_io,
        shutdown.clone(),
    ));
    (
        Framed::new(client_io, FrameCodec::new(max_frame)),
        shutdown,
    )
}

fn request_frame(correlation_id: u32, method: &str, data: serde_json::Value) -> Frame {
    let request = RpcRequest {
        method: method.to_string(),
        data,
        metadata: HashMap::new(),
    };
    Frame::request(
        correlation_id,
        Bytes::from(serde_json::to_vec(&request).unwrap()),
    )
}

async fn next_frame(client: &mut Framed<tokio::io::DuplexStream, FrameCodec>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("decode failed")
}

fn decode_response(frame: &Frame) -> RpcResponse {
    serde_json::from_slice(&frame.payload).unwrap()
}

#[tokio::test]
async fn unary_call_round_trip() {
    let (mut client, _shutdown) = connect(vec![]);
    client
        .send(request_frame(7, "user.get", serde_json::json!({"id": 1})))
        .await
        .unwrap();

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(frame.correlation_id, 7);
    let response = decode_response(&frame);
    assert!(response.eos);
    assert_eq!(response.envelope.code, 0);
    assert_eq!(response.envelope.message, "OK");
    assert_eq!(response.envelope.data.as_ref().unwrap()["name"], "ada");
}

#[tokio::test]
async fn business_failure_uses_error_frame_with_envelope() {
    let (mut client, _shutdown) = connect(vec![]);
    client
        .send(request_frame(9, "user.get", serde_json::json!({"id": 404})))
        .await
        .unwrap();

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.correlation_id, 9);
    let response = decode_response(&frame);
    assert_eq!(response.envelope.code, 404);
    assert_eq!(response.envelope.message, "user 404 does not exist");
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let (mut client, _shutdown) = connect(vec![]);
    client
        .send(request_frame(1, "no.such.method", serde_json::Value::Null))
        .await
        .unwrap();

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(decode_response(&frame).envelope.code, 404);
}

#[tokio::test]
async fn streaming_emits_items_then_eos() {
    let (mut client, _shutdown) = connect(vec![]);
    client
        .send(request_frame(3, "user.watch", serde_json::json!({"n": 3})))
        .await
        .unwrap();

    for expected in 0..3 {
        let frame = next_frame(&mut client).await;
        assert_eq!(frame.frame_type, FrameType::Response);
        let response = decode_response(&frame);
        assert!(!response.eos);
        assert_eq!(response.envelope.data.as_ref().unwrap()["seq"], expected);
    }
    let frame = next_frame(&mut client).await;
    let response = decode_response(&frame);
    assert!(response.eos);
    assert_eq!(response.envelope.code, 0);
    assert!(response.envelope.data.is_none());
}

#[tokio::test]
async fn ping_answered_in_place() {
    let (mut client, _shutdown) = connect(vec![]);
    client
        .send(request_frame(11, PING_METHOD, serde_json::Value::Null))
        .await
        .unwrap();

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(frame.correlation_id, 11);
    assert_eq!(decode_response(&frame).envelope.message, "pong");
}

#[tokio::test]
async fn malformed_payload_is_invalid_argument() {
    let (mut client, _shutdown) = connect(vec![]);
    client
        .send(Frame::request(5, Bytes::from_static(b"not json")))
        .await
        .unwrap();

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(decode_response(&frame).envelope.code, 400);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_applies_to_rpc_resources() {
    let rule = RateLimitRule {
        name: "user-get".into(),
        resource: "rpc:user.get".into(),
        threshold: 2.0,
        stat_interval_ms: 1_000,
        enabled: true,
        description: None,
    };
    let (mut client, _shutdown) = connect(vec![rule]);

    for correlation in [1u32, 2] {
        client
            .send(request_frame(
                correlation,
                "user.get",
                serde_json::json!({"id": 1}),
            ))
            .await
            .unwrap();
        let frame = next_frame(&mut client).await;
        assert_eq!(frame.frame_type, FrameType::Response, "call {correlation}");
    }

    client
        .send(request_frame(3, "user.get", serde_json::json!({"id": 1})))
        .await
        .unwrap();
    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    let response = decode_response(&frame);
    assert_eq!(response.envelope.code, 429);
    let advisory = response.rate_limit.expect("advisory values on rejection");
    assert_eq!(advisory.remaining, 0);
    assert_eq!(advisory.limit, 2.0);
}

// After ping_interval (default 30s) of silence the server probes the
// connection with a sys.ping request; answering traffic keeps it usable.
#[tokio::test(start_paused = true)]
async fn quiet_connection_receives_keepalive_ping() {
    let (mut client, _shutdown) = connect(vec![]);
    // Let the connection task anchor its timers before advancing the clock.
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(31)).await;

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Request);
    let ping: RpcRequest = serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(ping.method, PING_METHOD);

    client
        .send(request_frame(1, "user.get", serde_json::json!({"id": 1})))
        .await
        .unwrap();
    let frame = next_frame(&mut client).await;
    assert_eq!(frame.frame_type, FrameType::Response);
}

// A peer that never answers anything is cut off at idle_timeout (60s in
// the test config), keepalive pings notwithstanding.
#[tokio::test(start_paused = true)]
async fn unresponsive_connection_closes_at_idle_timeout() {
    let (mut client, _shutdown) = connect(vec![]);
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(61)).await;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
            // Closed: the server gave up on the quiet peer.
            Ok(None) => break,
            // Keepalive pings may precede the close.
            Ok(Some(Ok(frame))) => assert_eq!(frame.frame_type, FrameType::Request),
            Ok(Some(Err(e))) => panic!("decode failed: {e}"),
            Err(_) => panic!("connection did not close"),
        }
    }
}

#[tokio::test]
async fn concurrent_calls_multiplex_by_correlation_id() {
    let (mut client, _shutdown) = connect(vec![]);
    for correlation in [21u32, 22, 23] {
        client
            .send(request_frame(
                correlation,
                "user.get",
                serde_json::json!({"id": correlation}),
            ))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let frame = next_frame(&mut client).await;
        let response = decode_response(&frame);
        assert_eq!(
            response.envelope.data.as_ref().unwrap()["id"],
            frame.correlation_id
        );
        seen.push(frame.correlation_id);
    }
    seen.sort();
    assert_eq!(seen, vec![21, 22, 23]);
}
