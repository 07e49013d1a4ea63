//! Service-method registry for the framed transport.
//!
//! Methods are keyed by `service.method` strings. A handler is unary (one
//! JSON value back) or server-streaming (a stream of JSON values, each
//! shipped as its own response frame).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use trellis_core::{Error, RequestContext};

/// A streamed sequence of response values.
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<serde_json::Value, Error>> + Send>>;

/// What a handler produces: a single value or a stream of them.
pub enum RpcReply {
    Unary(serde_json::Value),
    Stream(ValueStream),
}

impl std::fmt::Debug for RpcReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcReply::Unary(v) => f.debug_tuple("Unary").field(v).finish(),
            RpcReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

type Handler = Arc<
    dyn Fn(
            RequestContext,
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<RpcReply, Error>> + Send>>
        + Send
        + Sync,
>;

/// Thread-safe method table; registrations are allowed at any time, and
/// dispatch sees a consistent snapshot per call.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<RwLock<HashMap<String, Handler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary method. The request `data` is decoded into `In`;
    /// the handler's output is serialized into the response envelope.
    pub fn unary<In, Out, F, Fut>(&self, method: impl Into<String>, handler: F) -> &Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(RequestContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, Error>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method.into(), move |ctx, data| {
            let handler = handler.clone();
            Box::pin(async move {
                let input: In = decode_input(data)?;
                let output = handler(ctx, input).await?;
                let value = serde_json::to_value(output)
                    .map_err(|e| Error::internal(format!("response serialization: {e}")))?;
                Ok(RpcReply::Unary(value))
            })
        });
        self
    }

    /// Register a server-streaming method.
    pub fn streaming<In, F, Fut>(&self, method: impl Into<String>, handler: F) -> &Self
    where
        In: DeserializeOwned + Send + 'static,
        F: Fn(RequestContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, Error>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method.into(), move |ctx, data| {
            let handler = handler.clone();
            Box::pin(async move {
                let input: In = decode_input(data)?;
                let stream = handler(ctx, input).await?;
                Ok(RpcReply::Stream(stream))
            })
        });
        self
    }

    pub fn get(&self, method: &str) -> Option<Handler> {
        self.methods
            .read()
            .expect("method registry lock poisoned")
            .get(method)
            .cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .expect("method registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn insert<F>(&self, method: String, handler: F)
    where
        F: Fn(
                RequestContext,
                serde_json::Value,
            ) -> Pin<Box<dyn Future<Output = Result<RpcReply, Error>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let mut methods = self.methods.write().expect("method registry lock poisoned");
        if methods.insert(method.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(method, "rpc method re-registered, previous handler replaced");
        }
    }
}

pub(crate) fn dispatch_method(
    registry: &MethodRegistry,
    ctx: RequestContext,
    method: &str,
    data: serde_json::Value,
) -> Pin<Box<dyn Future<Output = Result<RpcReply, Error>> + Send>> {
    match registry.get(method) {
        Some(handler) => handler(ctx, data),
        None => {
            let method = method.to_string();
            Box::pin(async move { Err(Error::not_found(format!("unknown method '{method}'"))) })
        }
    }
}

fn decode_input<In: DeserializeOwned>(data: serde_json::Value) -> Result<In, Error> {
    serde_json::from_value(data)
        .map_err(|e| Error::invalid_argument(format!("request payload: {e}")))
}
