// ABOUTME: Fault boundary: the one place internal failures become the JSON error wire format.
// ABOUTME: Renders ApiError, caught panics, and any non-JSON error response as {success, statusCode, message}.

use std::any::Any;

use axum::Json;
use axum::extract::Request;
use axum::extract::rejection::JsonRejection;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tally_core::CredentialError;
use tally_store::StoreError;
use thiserror::Error;

pub const DEFAULT_MESSAGE: &str = "Internal Server Error";

/// Upper bound on an error body we are willing to buffer for re-rendering.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Every failure a handler can raise. Handlers never build error bodies;
/// they return one of these and the boundary renders it.
#[derive(Debug, Error)]
pub enum ApiError {
    /// An explicit status with an optional message.
    #[error("{status}: {}", message.as_deref().unwrap_or(DEFAULT_MESSAGE))]
    Status {
        status: StatusCode,
        message: Option<String>,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Store unavailable")]
    StoreUnavailable,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// A failure that carries neither status nor message.
    #[error("unhandled failure")]
    Unhandled,
}

impl ApiError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError::Status {
            status,
            message: Some(message.into()),
        }
    }

    /// The status code and client-facing message for this failure.
    pub fn render(&self) -> (StatusCode, String) {
        match self {
            ApiError::Status { status, message } => (
                *status,
                message.clone().unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable".to_string())
            }
            ApiError::Store(StoreError::AlreadyExists(msg)) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Store(err) if err.is_retryable() => {
                (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable".to_string())
            }
            ApiError::Store(_) | ApiError::Credential(_) | ApiError::Unhandled => {
                (StatusCode::INTERNAL_SERVER_ERROR, DEFAULT_MESSAGE.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::status(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.render();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        FailureEnvelope::new(status, message).into_response()
    }
}

/// The error wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEnvelope {
    pub success: bool,
    pub status_code: u16,
    pub message: String,
}

impl FailureEnvelope {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: status.as_u16(),
            message: message.into(),
        }
    }
}

impl IntoResponse for FailureEnvelope {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Router fallback for unmatched paths, including prefixes of absent modules.
pub async fn not_found() -> ApiError {
    ApiError::status(StatusCode::NOT_FOUND, "Not found")
}

/// Response for a handler that panicked. Used with `CatchPanicLayer::custom`.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(panic = %detail, "handler panicked");
    FailureEnvelope::new(StatusCode::INTERNAL_SERVER_ERROR, DEFAULT_MESSAGE).into_response()
}

/// Outermost middleware: any error response that is not already JSON
/// (method mismatches, framework rejections, bare status codes) is
/// re-rendered as a FailureEnvelope. Other response headers are kept.
pub async fn envelope_failures(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) || is_json(&response) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_ERROR_BODY)
        .await
        .unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes).trim().to_string();
    let message = if text.is_empty() {
        status
            .canonical_reason()
            .unwrap_or(DEFAULT_MESSAGE)
            .to_string()
    } else {
        text
    };

    let mut rendered = FailureEnvelope::new(status, message).into_response();
    for (name, value) in parts.headers.iter() {
        if name != CONTENT_TYPE && name != CONTENT_LENGTH {
            rendered.headers_mut().append(name.clone(), value.clone());
        }
    }
    rendered
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::routing::{get, post};
    use http::Request;
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;

    #[derive(Debug, Deserialize)]
    struct Payload {
        #[allow(dead_code)]
        name: String,
    }

    async fn raises_not_found() -> Result<&'static str, ApiError> {
        Err(ApiError::status(StatusCode::NOT_FOUND, "Not found"))
    }

    async fn raises_bare() -> Result<&'static str, ApiError> {
        Err(ApiError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: None,
        })
    }

    async fn raises_unhandled() -> Result<&'static str, ApiError> {
        Err(ApiError::Unhandled)
    }

    async fn raises_conflict() -> Result<&'static str, ApiError> {
        Err(StoreError::AlreadyExists("email taken".into()).into())
    }

    async fn raises_outage() -> Result<&'static str, ApiError> {
        Err(StoreError::Timeout(std::time::Duration::from_secs(1)).into())
    }

    async fn panics() -> &'static str {
        panic!("boom")
    }

    async fn needs_json(
        payload: Result<axum::Json<Payload>, JsonRejection>,
    ) -> Result<&'static str, ApiError> {
        let axum::Json(_payload) = payload?;
        Ok("ok")
    }

    fn test_router() -> Router {
        Router::new()
            .route("/not-found", get(raises_not_found))
            .route("/bare", get(raises_bare))
            .route("/unhandled", get(raises_unhandled))
            .route("/conflict", get(raises_conflict))
            .route("/outage", get(raises_outage))
            .route("/panic", get(panics))
            .route("/json", post(needs_json))
            .route("/plain", get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }))
            .fallback(not_found)
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(axum::middleware::from_fn(envelope_failures))
    }

    async fn call(req: Request<Body>) -> (StatusCode, FailureEnvelope, Option<String>) {
        let resp = test_router().oneshot(req).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap(), content_type)
    }

    async fn get_path(path: &str) -> (StatusCode, FailureEnvelope, Option<String>) {
        call(Request::get(path).body(Body::empty()).unwrap()).await
    }

    #[tokio::test]
    async fn status_and_message_pass_through() {
        let (status, body, content_type) = get_path("/not-found").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, FailureEnvelope::new(StatusCode::NOT_FOUND, "Not found"));
        assert_eq!(content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn missing_message_defaults() {
        let (status, body, _) = get_path("/bare").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, DEFAULT_MESSAGE);

        let (status, body, _) = get_path("/unhandled").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.status_code, 500);
        assert_eq!(body.message, "Internal Server Error");
        assert!(!body.success);
    }

    #[tokio::test]
    async fn store_errors_map_to_conflict_and_unavailable() {
        let (status, body, _) = get_path("/conflict").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.message, "email taken");

        let (status, body, _) = get_path("/outage").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.message, "Store unavailable");
    }

    #[tokio::test]
    async fn panics_become_envelopes() {
        let (status, body, _) = get_path("/panic").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, DEFAULT_MESSAGE);
    }

    #[tokio::test]
    async fn unmatched_paths_are_not_found() {
        let (status, body, _) = get_path("/api/metrics/dau").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.message, "Not found");
    }

    #[tokio::test]
    async fn rejections_and_plain_errors_are_rewrapped() {
        let (status, body, _) = call(
            Request::post("/json")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
        assert!(status.is_client_error());
        assert_eq!(body.status_code, status.as_u16());
        assert!(!body.message.is_empty());

        let (status, body, _) = get_path("/plain").await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(body.message, "short and stout");
    }

    #[tokio::test]
    async fn method_mismatch_keeps_allow_header() {
        let resp = test_router()
            .oneshot(Request::delete("/not-found").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(resp.headers().contains_key("allow"));
        assert!(is_json(&resp));
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let envelope = FailureEnvelope::new(StatusCode::NOT_FOUND, "Not found");
        let json = serde_json::to_value(envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": false, "statusCode": 404, "message": "Not found" })
        );
    }
}
