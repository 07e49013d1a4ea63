//! Trellis RPC transport.
//!
//! A length-prefixed binary framing (`frame`), a `service.method` registry
//! (`registry`), and a TCP server (`server`) that runs every call through
//! the same canonical chain as the HTTP transport, with `rpc:{method}`
//! resource keys and the shared response envelope.

pub mod frame;
pub mod registry;
pub mod server;

pub use frame::{Frame, FrameCodec, FrameType, PROTOCOL_VERSION};
pub use registry::{MethodRegistry, RpcReply, ValueStream};
pub use server::{serve_connection, RateAdvisory, RpcRequest, RpcResponse, RpcServer, PING_METHOD};
