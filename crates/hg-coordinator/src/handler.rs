//! Downstream business-service contract
//!
//! The coordinator guarantees at most one successful call per event id. A
//! crash between the call and the outcome write can still repeat a call, so
//! handlers must be idempotent on their side too.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Timeout, connection failure, 5xx-class answer. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The event can never be processed as sent. Not retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }

    /// Classify an HTTP answer from a downstream service
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 429 | 500..=599 => HandlerError::Transient(message.into()),
            _ => HandlerError::Permanent(message.into()),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_verified_event(&self, provider_id: &str, event_id: &str, payload: &Value)
        -> Result<(), HandlerError>;
}

/// Logs verified events; used when no downstream service is configured
#[derive(Debug, Default, Clone)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_verified_event(
        &self,
        provider_id: &str,
        event_id: &str,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        info!(
            provider_id = %provider_id,
            event_id = %event_id,
            fields = payload.as_object().map(|o| o.len()).unwrap_or(0),
            "Verified event received"
        );
        Ok(())
    }
}

/// Forwards verified events as JSON to a downstream HTTP service
pub struct HttpEventHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEventHandler {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandlerError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EventHandler for HttpEventHandler {
    async fn handle_verified_event(
        &self,
        provider_id: &str,
        event_id: &str,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        let body = json!({
            "providerId": provider_id,
            "eventId": event_id,
            "payload": payload,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", format!("{}:{}", provider_id, event_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::Transient("downstream request timed out".to_string())
                } else if e.is_connect() {
                    HandlerError::Transient(format!("connection failed: {}", e))
                } else {
                    HandlerError::Transient(format!("request error: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(event_id = %event_id, status = status.as_u16(), "Downstream accepted event");
            return Ok(());
        }
        Err(HandlerError::from_status(status.as_u16(), format!("HTTP {}", status.as_u16())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(HandlerError::from_status(503, "x").is_transient());
        assert!(HandlerError::from_status(500, "x").is_transient());
        assert!(HandlerError::from_status(429, "x").is_transient());
        assert!(HandlerError::from_status(408, "x").is_transient());
        assert!(!HandlerError::from_status(400, "x").is_transient());
        assert!(!HandlerError::from_status(422, "x").is_transient());
    }
}
