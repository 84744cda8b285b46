//! Rejections produced by the gate and their response payloads.
//!
//! CSRF reasons collapse into one external message. Auth failures carry a
//! machine-readable `code` so clients can branch without parsing prose.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::{csrf::CsrfFailure, rate_limit::RateLimitOutcome};

pub const CSRF_ERROR: &str = "CSRF token validation failed";
pub const CSRF_MESSAGE: &str =
    "Invalid or missing CSRF token. Please refresh the page and try again.";

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("email verification required")]
    Unverified,
    #[error("forbidden")]
    Forbidden,
    #[error("csrf validation failed: {0}")]
    Csrf(CsrfFailure),
    #[error("rate limited: {message}")]
    RateLimited {
        outcome: RateLimitOutcome,
        message: String,
    },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request body rejected: {0}")]
    Body(BodyFailure),
}

/// Why an unsafe request's body could not be buffered for the CSRF check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BodyFailure {
    #[error("declared length exceeds the buffer limit")]
    TooLarge,
    #[error("body stream failed or exceeded the buffer limit")]
    Unreadable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthCode {
    Unauthorized,
    EmailNotVerified,
    Forbidden,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthErrorBody {
    pub error: String,
    pub code: AuthCode,
    /// RFC 3339 time of the rejection.
    pub timestamp: String,
}

/// Used for CSRF, body and 503 rejections.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitBody {
    pub error: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

fn auth_response(status: StatusCode, error: &str, code: AuthCode) -> Response {
    let body = AuthErrorBody {
        error: error.to_string(),
        code,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated => auth_response(
                StatusCode::UNAUTHORIZED,
                "Authentication required",
                AuthCode::Unauthorized,
            ),
            Self::Unverified => auth_response(
                StatusCode::FORBIDDEN,
                "Email verification required. Please verify your email address.",
                AuthCode::EmailNotVerified,
            ),
            Self::Forbidden => {
                auth_response(StatusCode::FORBIDDEN, "Forbidden", AuthCode::Forbidden)
            }
            Self::Csrf(_) => (
                StatusCode::FORBIDDEN,
                Json(MessageErrorBody {
                    error: CSRF_ERROR.to_string(),
                    message: CSRF_MESSAGE.to_string(),
                }),
            )
                .into_response(),
            Self::RateLimited { outcome, message } => {
                let denied = RateLimitOutcome {
                    remaining: 0,
                    ..outcome
                };
                let body = RateLimitBody {
                    error: message,
                    retry_after: denied.retry_after_seconds,
                    kind: "RATE_LIMIT".to_string(),
                };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                denied.apply_headers(headers);
                headers.insert(RETRY_AFTER, HeaderValue::from(denied.retry_after_seconds));
                response
            }
            Self::Body(BodyFailure::TooLarge) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(MessageErrorBody {
                    error: "Payload too large".to_string(),
                    message: "Request body exceeds the 1 MiB limit.".to_string(),
                }),
            )
                .into_response(),
            Self::Body(BodyFailure::Unreadable) => (
                StatusCode::BAD_REQUEST,
                Json(MessageErrorBody {
                    error: "Invalid request body".to_string(),
                    message: "Request body could not be read or exceeds the 1 MiB limit."
                        .to_string(),
                }),
            )
                .into_response(),
            Self::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(MessageErrorBody {
                    error: "Service unavailable".to_string(),
                    message,
                }),
            )
                .into_response(),
        }
    }
}
