//! HTTP error rendering

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use electric_core::reader::ELECTRIC_HEADERS;
use electric_core::ErrorCategory;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Seconds a client should wait before retrying an admission failure
pub const RETRY_AFTER_SECS: u64 = 5;

/// Error body: `{"error": code, "message": text}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Errors returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] electric_core::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Core(e) => e.category(),
            ApiError::BadRequest(_) => ErrorCategory::BadRequest,
            ApiError::NotFound(_) => ErrorCategory::NotFound,
            ApiError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.category().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Result type for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.category();
        if category == ErrorCategory::Internal {
            error!("Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: category.as_str(),
            message: self.to_string(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        let headers = response.headers_mut();

        match category {
            ErrorCategory::ShapeGone => {
                for name in ELECTRIC_HEADERS {
                    headers.remove(*name);
                }
                headers.insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-cache, no-store, must-revalidate"),
                );
            }
            ErrorCategory::Unavailable => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            }
            _ => {}
        }
        response
    }
}

/// Render a recovered handler panic as an internal error
pub fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: ErrorCategory::Internal.as_str(),
            message: "internal server error".to_string(),
        }),
    )
        .into_response()
}
