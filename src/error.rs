//! API error type shared by validators, business rules and handlers.
//!
//! Every failure carries a stable [`ErrorCode`], a human message and optional
//! structured details. The HTTP status is derived from the code, so callers
//! never pick a status by hand.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

use crate::storage::StorageError;

/// Stable, client-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    Unauthorized,
    Forbidden,
    NotFound,
    DuplicateEmail,
    SlotFull,
    DoubleBooking,
    InvalidDate,
    InvalidAge,
    InvalidCapacity,
    InvalidRole,
    InvalidStatus,
    InvalidToken,
    ChildNotFound,
    SlotNotFound,
    ReservationNotFound,
    CsrfInvalid,
    RateLimitExceeded,
    Internal,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidInput
            | Self::InvalidDate
            | Self::InvalidAge
            | Self::InvalidCapacity
            | Self::InvalidRole
            | Self::InvalidStatus
            | Self::InvalidToken => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::CsrfInvalid => StatusCode::FORBIDDEN,
            Self::NotFound
            | Self::ChildNotFound
            | Self::SlotNotFound
            | Self::ReservationNotFound => StatusCode::NOT_FOUND,
            Self::DuplicateEmail | Self::SlotFull | Self::DoubleBooking => StatusCode::CONFLICT,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::DuplicateEmail => "DUPLICATE_EMAIL",
            Self::SlotFull => "SLOT_FULL",
            Self::DoubleBooking => "DOUBLE_BOOKING",
            Self::InvalidDate => "INVALID_DATE",
            Self::InvalidAge => "INVALID_AGE",
            Self::InvalidCapacity => "INVALID_CAPACITY",
            Self::InvalidRole => "INVALID_ROLE",
            Self::InvalidStatus => "INVALID_STATUS",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::ChildNotFound => "CHILD_NOT_FOUND",
            Self::SlotNotFound => "SLOT_NOT_FOUND",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::CsrfInvalid => "CSRF_INVALID",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every fallible operation on the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details (field name, offending value, bounds...).
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden() -> Self {
        Self::new(ErrorCode::Forbidden, "Forbidden")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Bad id in a path segment, e.g. `/api/parent/children/abc`.
    pub fn invalid_id(field: &str, raw: &str) -> Self {
        let label = field.trim_end_matches("_id").replace('_', " ");
        Self::invalid_input(format!("Invalid {label} ID")).with_details(json!({ field: raw }))
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// Seconds the caller should wait, for rate-limit errors.
    fn retry_after(&self) -> Option<i64> {
        self.details
            .as_ref()
            .and_then(|d| d.get("retry_after"))
            .and_then(Value::as_i64)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(code = %self.code, message = %self.message, "request rejected");
        }

        let body = ErrorBody {
            error: &self.message,
            code: self.code,
            details: self.details.as_ref(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Persistence failures never leak internals to the client.
impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateEmail(email) => {
                Self::new(ErrorCode::DuplicateEmail, "Email already registered")
                    .with_details(json!({ "email": email }))
            }
            other => {
                tracing::error!(error = %other, "storage failure");
                Self::internal("An internal error occurred")
            }
        }
    }
}
