//! Error taxonomy and JSON error responses.
//!
//! # Design Decisions
//! - Every failure leaves the server as `{ "error": ... }` JSON
//! - 429 responses carry `retryAfter` in the body and a `Retry-After` header
//! - Internal details are exposed only in development

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::any::Any;

use crate::config::Environment;
use crate::security::validator::FileRejection;

const GENERIC_INTERNAL: &str = "Internal server error";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Failed the pre-routing header gate.
    #[error("Invalid request")]
    InvalidRequest,

    #[error("{0}")]
    NotFound(String),

    #[error("Route not found")]
    RouteNotFound,

    #[error("Too many requests")]
    TooManyRequests { retry_after: u64 },

    #[error("Request timeout")]
    RequestTimeout,

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn rate_limited(retry_after: u64) -> Self {
        Self::TooManyRequests { retry_after }
    }

    /// A 500 whose message is only revealed outside production.
    pub fn internal(err: impl std::fmt::Display, environment: Environment) -> Self {
        if environment.is_production() {
            Self::Internal(GENERIC_INTERNAL.to_owned())
        } else {
            Self::Internal(err.to_string())
        }
    }

    /// Map a refused snapshot request onto the taxonomy.
    pub fn from_rejection(rejection: FileRejection, environment: Environment) -> Self {
        match rejection {
            FileRejection::NotFound | FileRejection::EmptyFile => {
                Self::NotFound("Snapshot not found".to_owned())
            }
            FileRejection::ExtensionNotAllowed | FileRejection::MimeNotAllowed(_) => {
                Self::BadRequest("File type not allowed".to_owned())
            }
            FileRejection::OutsideBaseDir => Self::BadRequest("Invalid file path".to_owned()),
            FileRejection::Io(e) => Self::internal(e, environment),
            FileRejection::EmptyName
            | FileRejection::NameTooLong
            | FileRejection::PatternMismatch
            | FileRejection::ForbiddenSequence(_) => Self::BadRequest("Invalid filename".to_owned()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let retry_after = match &self {
            Self::TooManyRequests { retry_after } => Some(*retry_after),
            _ => None,
        };

        let mut response = (
            self.status(),
            Json(ErrorBody {
                error: &message,
                retry_after,
            }),
        )
            .into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Turn a handler panic into the standard 500 body.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>, environment: Environment) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("handler panicked");
    tracing::error!(panic = %detail, "Request handler panicked");
    ApiError::internal(detail, environment).into_response()
}

/// Fallback for unmatched routes.
pub async fn route_not_found() -> ApiError {
    ApiError::RouteNotFound
}
