use crate::key_pool::QuotaError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// 所有 key 当日配额耗尽：附带距离下次重置的秒数。
    #[error("{message}")]
    QuotaExhausted {
        message: String,
        retry_after_seconds: i64,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<i64>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn quota_exhausted(err: QuotaError, retry_after_seconds: i64) -> Self {
        Self::QuotaExhausted {
            message: err.to_string(),
            retry_after_seconds,
        }
    }

    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::QuotaExhausted { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exhausted"),
            AppError::Quota(q) => match q {
                QuotaError::NoAvailableKey { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "quota_exhausted")
                }
                QuotaError::UpstreamUnavailable { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
                }
                QuotaError::FatalRequest {
                    status: Some(404), ..
                } => (StatusCode::NOT_FOUND, "not_found"),
                QuotaError::FatalRequest { .. } => (StatusCode::BAD_GATEWAY, "upstream_rejected"),
                QuotaError::UnknownKey(_) => (StatusCode::NOT_FOUND, "unknown_key"),
                QuotaError::DuplicateKey(_)
                | QuotaError::InvalidKey(_)
                | QuotaError::EmptyPool
                | QuotaError::QuotaExceeded { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "quota_internal")
                }
            },
            AppError::Anyhow(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty) = self.status_and_type();
        let retry_after_seconds = match &self {
            AppError::QuotaExhausted {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: ty,
                retry_after_seconds,
            },
        };
        (status, Json(body)).into_response()
    }
}
