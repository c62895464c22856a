use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::responses::RequestMeta;
use crate::settings::ValidationError;
use crate::types::{OrderId, UserId};

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_BAD_REQUEST: &str = "BAD_REQUEST";
pub const E_INVALID_SETTINGS: &str = "INVALID_SETTINGS";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_COMMISSION_RETRY: &str = "COMMISSION_RETRY";
pub const E_USER_CONFLICT: &str = "USER_CONFLICT";
pub const E_USER_NOT_FOUND: &str = "USER_NOT_FOUND";
pub const E_ORDER_NOT_FOUND: &str = "ORDER_NOT_FOUND";
pub const E_BAD_REFERRER: &str = "BAD_REFERRER";

/// Failures of engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("order amount must be >= 0, got {0}")]
    InvalidAmount(i64),
    #[error("user {0} already exists")]
    UserExists(UserId),
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("referrer {0} not found")]
    UnknownReferrer(UserId),
    #[error("referral code {0} not found")]
    UnknownReferralCode(String),
    #[error("a user cannot refer themselves")]
    SelfReferral,
    #[error("order {0} has no commission record")]
    OrderNotFound(OrderId),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// Transient failure; the caller should retry the same request.
    Unavailable(anyhow::Error),
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
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl EngineError {
    /// Maps to an API error. `storage_code` labels storage failures, which are
    /// reported as retriable when `retriable` is set.
    pub fn into_api(
        self,
        meta: RequestMeta,
        storage_code: &str,
        retriable: bool,
    ) -> ApiErrorWithMeta {
        let message = self.to_string();
        let (error, code) = match self {
            EngineError::Validation(_) => (ApiError::BadRequest(message), E_INVALID_SETTINGS),
            EngineError::InvalidAmount(_) => (ApiError::BadRequest(message), E_BAD_AMOUNT),
            EngineError::UserExists(_) => (ApiError::Conflict(message), E_USER_CONFLICT),
            EngineError::UserNotFound(_) => (ApiError::NotFound(message), E_USER_NOT_FOUND),
            EngineError::UnknownReferrer(_)
            | EngineError::UnknownReferralCode(_)
            | EngineError::SelfReferral => (ApiError::BadRequest(message), E_BAD_REFERRER),
            EngineError::OrderNotFound(_) => (ApiError::NotFound(message), E_ORDER_NOT_FOUND),
            EngineError::Storage(e) if retriable => (ApiError::Unavailable(e), storage_code),
            EngineError::Storage(e) => (ApiError::Internal(e), storage_code),
        };
        error.with_meta(meta).with_code(code)
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(e) => {
                warn!("retriable failure: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "temporarily unavailable, retry with the same request".to_string(),
                )
            }
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
