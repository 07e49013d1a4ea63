//! Trellis HTTP transport.
//!
//! An axum router wrapped by the canonical chain (`trellis-pipeline`), so
//! every route gets recovery, logging, protection, tracing, and metrics
//! with the `http:{METHOD}:{route}` resource-key scheme. Responses use the
//! `{code, message, data?, trace_id?}` envelope; rate-limited responses
//! carry the three `X-RateLimit-*` advisory headers.

pub mod admin;
pub mod envelope;
pub mod health;
pub mod layer;
pub mod server;

pub use admin::{admin_router, AdminState};
pub use envelope::{Api, ApiError, ApiResult, Envelope};
pub use health::HealthSource;
pub use layer::PipelineLayer;
pub use server::HttpServer;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use trellis_core::RequestContext;

/// Extractor handing the per-request [`RequestContext`] to handlers.
///
/// ```ignore
/// async fn get_user(Ctx(ctx): Ctx, Path(id): Path<u64>) -> ApiResult<User> {
///     let user = store.fetch(id, ctx.cancellation()).await?;
///     Ok(Api(user))
/// }
/// ```
pub struct Ctx(pub RequestContext);

impl<S: Send + Sync> FromRequestParts<S> for Ctx {
    type Rejection = (StatusCode, &'static str);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            parts
                .extensions
                .get::<RequestContext>()
                .cloned()
                .map(Ctx)
                .ok_or((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request context missing; is the pipeline layer installed?",
                ))
        }
    }
}
