//! Audit sink contract
//!
//! Append-only `record(action, resource_type, resource_id, details, actor)`.
//! Failures to write are logged by [`record_best_effort`] and never reach the
//! primary flow.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Audit action type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    WebhookAccepted,
    WebhookRejected,
    WebhookDuplicate,
    ReplayDetected,
    RateLimited,
    /// Replay protection failed open because the shared store was unreachable
    ReplayProtectionDegraded,
    /// Rate limiting failed open because the shared store was unreachable
    RateLimitDegraded,
    EventCompleted,
    EventFailed,
    RetryScheduled,
    IncidentOpened,
    /// Open incident raised to a higher severity
    IncidentEscalated,
    IncidentClosed,
    ProviderDisabled,
    ProviderEnabled,
    ConfigReloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    /// Resource type affected (e.g., "WebhookEvent", "Provider", "Incident")
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    /// Who or what triggered the action
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        severity: AuditSeverity,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        details: serde_json::Value,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            severity,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            details,
            actor: actor.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Audit write failed: {0}")]
pub struct AuditError(pub String);

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Write an audit record, logging instead of propagating failures
pub async fn record_best_effort(sink: &Arc<dyn AuditSink>, record: AuditRecord) {
    let action = record.action;
    let resource_id = record.resource_id.clone();
    if let Err(e) = sink.record(record).await {
        error!(
            action = ?action,
            resource_id = %resource_id,
            error = %e,
            "Failed to write audit record"
        );
    }
}

/// Emits audit records as structured log lines
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        match record.severity {
            AuditSeverity::High => warn!(
                target: "hookguard::audit",
                action = ?record.action,
                resource_type = %record.resource_type,
                resource_id = %record.resource_id,
                actor = %record.actor,
                details = %record.details,
                "audit"
            ),
            _ => info!(
                target: "hookguard::audit",
                action = ?record.action,
                resource_type = %record.resource_type,
                resource_id = %record.resource_id,
                actor = %record.actor,
                details = %record.details,
                "audit"
            ),
        }
        Ok(())
    }
}

/// Keeps records in memory; used by tests and the monitoring API
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.records.lock().iter().filter(|r| r.action == action).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record);
        Ok(())
    }
}
