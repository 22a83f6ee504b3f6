use axum::{
    Json,
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Per-request metadata echoed in every envelope.
#[derive(Clone, Debug, Serialize)]
pub struct RequestMeta {
    pub request_id: String,
    /// RFC 3339.
    pub request_at: String,
    pub timestamp: i64,
}

impl RequestMeta {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        RequestMeta {
            request_id: Uuid::new_v4().to_string(),
            request_at: now.to_rfc3339(),
            timestamp: now.timestamp(),
        }
    }
}

impl Default for RequestMeta {
    fn default() -> Self {
        Self::new()
    }
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Stamps each request with a fresh [`RequestMeta`] and echoes its id in the
/// `x-request-id` response header.
pub async fn meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    let meta = RequestMeta::new();
    let header = HeaderValue::from_str(&meta.request_id).ok();
    req.extensions_mut().insert(meta);

    let mut resp = next.run(req).await;
    if let Some(value) = header {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

#[derive(Serialize)]
pub struct SuccessEnvelope<T> {
    pub message: String,
    pub data: T,
    pub meta: RequestMeta,
}

pub struct ApiOk<T> {
    status: StatusCode,
    body: SuccessEnvelope<T>,
}

impl<T> ApiOk<T> {
    fn with_status(status: StatusCode, message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self {
            status,
            body: SuccessEnvelope {
                message: message.into(),
                data,
                meta,
            },
        }
    }

    pub fn ok(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::with_status(StatusCode::OK, message, data, meta)
    }

    pub fn created(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::with_status(StatusCode::CREATED, message, data, meta)
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
