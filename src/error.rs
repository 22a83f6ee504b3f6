use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::responses::RequestMeta;
use crate::types::InvestmentStatus;

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_BAD_LEVEL: &str = "BAD_LEVEL";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_PROFILE_CONFLICT: &str = "PROFILE_CONFLICT";
pub const E_AGGREGATION_FAILURE: &str = "AGGREGATION_FAILURE";
pub const E_AGGREGATION_TIMEOUT: &str = "AGGREGATION_TIMEOUT";
pub const E_SESSION_FAILURE: &str = "SESSION_FAILURE";
pub const E_MALFORMED_INVESTMENT: &str = "MALFORMED_INVESTMENT";
pub const E_BELOW_MINIMUM: &str = "BELOW_MINIMUM";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";

/// Failure while building a referral report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    /// The store query failed.
    #[error("store query failed: {0}")]
    Store(String),
    /// The store answered with rows that do not fit the referral forest.
    #[error("malformed store response: {0}")]
    Malformed(String),
    /// The load did not finish in time. Retryable.
    #[error("referral load timed out after {0:?}")]
    TimedOut(Duration),
}

impl AggregationError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// Failure of a referral load as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("no authenticated session")]
    Unauthenticated,
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Invalid numeric input to the accrual functions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("amount must be >= 0, got {0}")]
    NegativeAmount(rust_decimal::Decimal),
    #[error("daily_roi must be >= 0, got {0}")]
    NegativeRate(rust_decimal::Decimal),
    #[error("amount is too large to compute returns for")]
    Overflow,
}

/// A status change that would move an investment backwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("investment cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: InvestmentStatus,
    pub to: InvestmentStatus,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }

    /// Maps a referral load failure onto its response and code.
    pub fn from_load(err: LoadError, meta: RequestMeta) -> ApiErrorWithMeta {
        match err {
            LoadError::Unauthenticated => ApiError::Unauthorized(err.to_string())
                .with_meta(meta)
                .with_code(E_UNAUTHENTICATED),
            LoadError::Aggregation(AggregationError::TimedOut(_)) => {
                ApiError::Unavailable(err.to_string())
                    .with_meta(meta)
                    .with_code(E_AGGREGATION_TIMEOUT)
            }
            LoadError::Aggregation(_) => ApiError::BadGateway(err.to_string())
                .with_meta(meta)
                .with_code(E_AGGREGATION_FAILURE),
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
