//! Error taxonomy to HTTP status mapping

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use hg_common::{ErrorKind, HookGuardError, SecurityViolation, ValidationFailure};

/// Standard API error body
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

/// A `HookGuardError` on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiFailure(pub HookGuardError);

impl From<HookGuardError> for ApiFailure {
    fn from(e: HookGuardError) -> Self {
        Self(e)
    }
}

impl ApiFailure {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HookGuardError::SecurityViolation(SecurityViolation::PayloadTooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            HookGuardError::SecurityViolation(_) => StatusCode::UNAUTHORIZED,
            HookGuardError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            HookGuardError::PermanentValidationFailure(ValidationFailure::UnconfiguredProvider(_)) => {
                StatusCode::NOT_FOUND
            }
            HookGuardError::PermanentValidationFailure(_) => StatusCode::BAD_REQUEST,
            HookGuardError::TransientProviderFailure { .. } => StatusCode::BAD_GATEWAY,
            HookGuardError::InfrastructureDegradation { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self.0.kind() {
            ErrorKind::SecurityViolation => "SECURITY_VIOLATION",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::TransientProviderFailure => "TRANSIENT_FAILURE",
            ErrorKind::PermanentValidationFailure => "VALIDATION_FAILED",
            ErrorKind::InfrastructureDegradation => "UNAVAILABLE",
        }
    }

    /// Security rejections get a generic message so the response is no
    /// signature oracle; the specific reason is in the audit trail.
    fn message(&self) -> String {
        match &self.0 {
            HookGuardError::SecurityViolation(SecurityViolation::PayloadTooLarge { limit, .. }) => {
                format!("payload exceeds {} bytes", limit)
            }
            HookGuardError::SecurityViolation(_) => "webhook rejected".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiError {
            error: self.code().to_string(),
            message: self.message(),
        };
        let mut response = (status, Json(body)).into_response();

        if let HookGuardError::RateLimited { retry_after_secs } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
