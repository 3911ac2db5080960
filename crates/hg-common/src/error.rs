//! Error taxonomy shared by every HookGuard component

use serde::Serialize;
use thiserror::Error;

/// Coarse classification that drives retry and response behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    SecurityViolation,
    RateLimited,
    TransientProviderFailure,
    PermanentValidationFailure,
    InfrastructureDegradation,
}

/// Reasons an inbound delivery is considered hostile or untrustworthy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityViolation {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("timestamp outside tolerance ({skew_secs}s skew, {tolerance_secs}s allowed)")]
    StaleTimestamp { skew_secs: i64, tolerance_secs: u64 },

    #[error("replayed event {event_id}")]
    Replay { event_id: String },

    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("replay protection unavailable for fail-closed provider")]
    ReplayProtectionUnavailable,
}

/// Requests that can never succeed as sent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("unconfigured provider: {0}")]
    UnconfiguredProvider(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid field {field}: {message}")]
    InvalidField { field: String, message: String },
}

#[derive(Debug, Error)]
pub enum HookGuardError {
    #[error("Security violation: {0}")]
    SecurityViolation(#[from] SecurityViolation),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Transient provider failure: {message}")]
    TransientProviderFailure { message: String },

    #[error("Validation failure: {0}")]
    PermanentValidationFailure(#[from] ValidationFailure),

    #[error("Infrastructure degradation: {message}")]
    InfrastructureDegradation { message: String },
}

impl HookGuardError {
    pub fn unconfigured_provider(provider_id: impl Into<String>) -> Self {
        Self::PermanentValidationFailure(ValidationFailure::UnconfiguredProvider(provider_id.into()))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientProviderFailure { message: message.into() }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::InfrastructureDegradation { message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SecurityViolation(_) => ErrorKind::SecurityViolation,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::TransientProviderFailure { .. } => ErrorKind::TransientProviderFailure,
            Self::PermanentValidationFailure(_) => ErrorKind::PermanentValidationFailure,
            Self::InfrastructureDegradation { .. } => ErrorKind::InfrastructureDegradation,
        }
    }

    /// Only transient provider failures go back through the retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientProviderFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(HookGuardError::transient("timeout").is_retryable());
        assert!(!HookGuardError::from(SecurityViolation::MissingSignature).is_retryable());
        assert!(!HookGuardError::unconfigured_provider("x").is_retryable());
        assert!(!HookGuardError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(!HookGuardError::infrastructure("redis down").is_retryable());
    }

    #[test]
    fn test_stale_timestamp_message() {
        let err = HookGuardError::from(SecurityViolation::StaleTimestamp { skew_secs: 301, tolerance_secs: 300 });
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(err.to_string().contains("timestamp outside tolerance"));
    }
}
