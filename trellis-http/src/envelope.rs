//! The canonical JSON response envelope: `{code, message, data?, trace_id?}`.
//!
//! `code` is `0` for success; failures mirror the HTTP status. Handlers
//! return [`ApiResult`], which shapes both arms into the envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use trellis_core::Error;

pub use trellis_pipeline::Envelope;

/// Successful handler payload, serialized into the envelope's `data`.
pub struct Api<T>(pub T);

impl<T: Serialize> IntoResponse for Api<T> {
    fn into_response(self) -> Response {
        match serde_json::to_value(self.0) {
            Ok(data) => Json(Envelope::ok(data)).into_response(),
            Err(e) => ApiError(Error::internal(format!("response serialization: {e}")))
                .into_response(),
        }
    }
}

/// Typed handler failure. The response carries the envelope body and also
/// stashes the [`Error`] in the response extensions so the pipeline layer
/// can classify the outcome without re-parsing the body.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = error_response(&self.0, None);
        response.extensions_mut().insert(self.0);
        response
    }
}

pub type ApiResult<T> = Result<Api<T>, ApiError>;

/// Build the enveloped error response for a typed failure.
pub fn error_response(error: &Error, trace_id: Option<&str>) -> Response {
    let status = StatusCode::from_u16(error.kind().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(Envelope::failure(error, trace_id))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use trellis_core::Kind;

    async fn parts(response: Response) -> (StatusCode, Envelope) {
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn success_envelope_shape() {
        let (status, envelope) = parts(Api(serde_json::json!({"id": 7})).into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.code, 0);
        assert_eq!(envelope.message, "OK");
        assert_eq!(envelope.data.unwrap()["id"], 7);
    }

    #[tokio::test]
    async fn failure_mirrors_http_status() {
        let (status, envelope) =
            parts(ApiError(Error::not_found("user 7 does not exist")).into_response()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(envelope.code, 404);
        assert_eq!(envelope.message, "user 7 does not exist");
        assert!(envelope.data.is_none());
    }

    #[tokio::test]
    async fn canceled_maps_to_client_closed_request() {
        let response = error_response(&Error::canceled("gone"), None);
        assert_eq!(response.status().as_u16(), 499);
    }

    #[tokio::test]
    async fn error_extension_carries_the_kind() {
        let response = ApiError(Error::conflict("duplicate")).into_response();
        let error = response.extensions().get::<Error>().unwrap();
        assert_eq!(error.kind(), Kind::Conflict);
    }
}
