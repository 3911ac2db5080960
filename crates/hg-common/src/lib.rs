//! HookGuard shared types
//!
//! Data model shared by every crate in the workspace:
//! - Provider configuration and dependency edges
//! - Inbound events and verification results
//! - Processing outcomes (append-only audit trail entries)
//! - Health status, cascade flags and incidents
//! - Error taxonomy used across verification, coordination and health tracking

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod audit;
pub mod clock;
pub mod error;
pub mod logging;

pub use audit::{AuditAction, AuditRecord, AuditSeverity, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ErrorKind, HookGuardError, SecurityViolation, ValidationFailure};

pub type Result<T> = std::result::Result<T, HookGuardError>;

// ============================================================================
// Provider Configuration
// ============================================================================

/// Signing scheme a provider uses for its webhook deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// `t=<unix>,v1=<hex>` header; HMAC-SHA256 over `"{t}.{payload}"`
    TimestampedHmacSha256,
    /// Base64 HMAC-SHA1 over the request URL followed by the sorted form parameters
    UrlParamsHmacSha1,
    /// `<algorithm>=<base64>` header; HMAC-SHA256 over the payload
    PrefixedHmacSha256Base64,
    /// Lowercase hex HMAC-SHA256 over the payload
    HmacSha256Hex,
}

/// How far an outage of one provider is expected to spread to its dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadeRisk {
    #[default]
    Low,
    Medium,
    High,
}

/// Static dependency graph edges for a provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdges {
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
    #[serde(default)]
    pub critical_path: bool,
    #[serde(default)]
    pub cascade_risk: CascadeRisk,
}

/// Fixed-window rate limit applied per (provider, source)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u64,
}

/// Per-provider configuration. Immutable once loaded; reloads swap the whole set.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    /// Accepted signing secrets, newest first. Any match authenticates.
    #[serde(default)]
    pub secrets: Vec<String>,
    pub scheme: SignatureScheme,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default)]
    pub timestamp_header: Option<String>,
    #[serde(default)]
    pub timestamp_tolerance_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub replay_protection: bool,
    /// Reject events instead of failing open when the replay store is unreachable
    #[serde(default)]
    pub replay_fail_closed: bool,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub dependencies: DependencyEdges,
    /// Event types processed synchronously on the critical path
    #[serde(default)]
    pub critical_event_types: Vec<String>,
    /// Dot-separated JSON paths that must be present in every payload
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default = "default_event_id_field")]
    pub event_id_field: String,
    #[serde(default = "default_event_type_field")]
    pub event_type_field: String,
    #[serde(default = "default_warning_latency_ms")]
    pub warning_latency_ms: u64,
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_priority() -> u8 {
    5
}

fn default_event_id_field() -> String {
    "id".to_string()
}

fn default_event_type_field() -> String {
    "type".to_string()
}

fn default_warning_latency_ms() -> u64 {
    2000
}

impl ProviderConfig {
    /// Minimal configuration for a provider; everything else takes defaults
    pub fn new(provider_id: impl Into<String>, scheme: SignatureScheme, secret: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            secrets: vec![secret.into()],
            scheme,
            signature_header: default_signature_header(),
            timestamp_header: None,
            timestamp_tolerance_secs: None,
            replay_protection: true,
            replay_fail_closed: false,
            max_payload_bytes: default_max_payload_bytes(),
            priority: default_priority(),
            dependencies: DependencyEdges::default(),
            critical_event_types: Vec::new(),
            required_fields: Vec::new(),
            event_id_field: default_event_id_field(),
            event_type_field: default_event_type_field(),
            warning_latency_ms: default_warning_latency_ms(),
            probe_url: None,
            rate_limit: None,
        }
    }

    pub fn with_tolerance(mut self, secs: u64) -> Self {
        self.timestamp_tolerance_secs = Some(secs);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: DependencyEdges) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_critical_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_event_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rate_limit(mut self, window_secs: u64, max_requests: u64) -> Self {
        self.rate_limit = Some(RateLimitConfig { window_secs, max_requests });
        self
    }

    pub fn is_critical_event(&self, event_type: Option<&str>) -> bool {
        event_type
            .map(|t| self.critical_event_types.iter().any(|c| c == t))
            .unwrap_or(false)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_id", &self.provider_id)
            .field("secrets", &format_args!("<{} redacted>", self.secrets.len()))
            .field("scheme", &self.scheme)
            .field("timestamp_tolerance_secs", &self.timestamp_tolerance_secs)
            .field("replay_protection", &self.replay_protection)
            .field("replay_fail_closed", &self.replay_fail_closed)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Inbound Events
// ============================================================================

/// Raw request handed over by the transport layer. The body is kept byte-exact.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub provider_id: String,
    pub raw_body: Bytes,
    /// Header names are lowercased on construction
    pub headers: HashMap<String, String>,
    /// Caller identity used for rate limiting (remote address, account id, ...)
    pub source_identifier: Option<String>,
    /// Full public URL the provider posted to (needed by URL-signing schemes)
    pub request_url: Option<String>,
}

impl InboundRequest {
    pub fn new(provider_id: impl Into<String>, raw_body: impl Into<Bytes>) -> Self {
        Self {
            provider_id: provider_id.into(),
            raw_body: raw_body.into(),
            headers: HashMap::new(),
            source_identifier: None,
            request_url: None,
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_identifier = Some(source.into());
        self
    }

    pub fn with_request_url(mut self, url: impl Into<String>) -> Self {
        self.request_url = Some(url.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A verified inbound event. `event_id` is the deduplication key.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub provider_id: String,
    pub event_id: String,
    pub event_type: Option<String>,
    pub raw_payload: Bytes,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

/// Result of a single verification attempt. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
    pub extracted_event_id: Option<String>,
    pub is_replay: bool,
}

impl VerificationResult {
    pub fn valid(extracted_event_id: Option<String>) -> Self {
        Self {
            valid: true,
            reason: None,
            extracted_event_id,
            is_replay: false,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            extracted_event_id: None,
            is_replay: false,
        }
    }

    /// Copy of this result flagged as a replay
    pub fn as_replay(&self) -> Self {
        Self {
            valid: self.valid,
            reason: Some("event already delivered".to_string()),
            extracted_event_id: self.extracted_event_id.clone(),
            is_replay: true,
        }
    }
}

// ============================================================================
// Processing Outcomes
// ============================================================================

/// One entry in the append-only processing trail of an event.
/// A retry appends a new outcome; earlier entries are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutcome {
    pub event_id: String,
    pub provider_id: String,
    pub success: bool,
    pub processing_time_ms: u64,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ProcessingOutcome {
    pub fn succeeded(event_id: &str, provider_id: &str, processing_time_ms: u64, retry_count: u32) -> Self {
        Self {
            event_id: event_id.to_string(),
            provider_id: provider_id.to_string(),
            success: true,
            processing_time_ms,
            retry_count,
            next_retry_at: None,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        event_id: &str,
        provider_id: &str,
        processing_time_ms: u64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            provider_id: provider_id.to_string(),
            success: false,
            processing_time_ms,
            retry_count,
            next_retry_at,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }

    /// Failed with no further retry scheduled
    pub fn is_exhausted(&self) -> bool {
        !self.success && self.next_retry_at.is_none()
    }
}

// ============================================================================
// Health Types
// ============================================================================

/// Health state of an integrated provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    /// Operator-controlled; only an explicit re-enable leaves this state
    Disabled,
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Marks a provider as at risk because something it depends on is unhealthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeFlag {
    pub source_provider: String,
    pub risk: CascadeRisk,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthStatus {
    pub provider_id: String,
    pub status: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub rolling_avg_latency_ms: f64,
    pub error_rate_pct: f64,
    pub last_transition_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub cascade_flags: Vec<CascadeFlag>,
}

impl ServiceHealthStatus {
    pub fn new(provider_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.into(),
            status: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            rolling_avg_latency_ms: 0.0,
            error_rate_pct: 0.0,
            last_transition_at: now,
            last_checked_at: None,
            cascade_flags: Vec::new(),
        }
    }

    pub fn at_risk(&self) -> bool {
        !self.cascade_flags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Warning,
    Major,
    Critical,
}

/// Opened when a provider leaves `healthy`, closed when it returns.
/// At most one incident per provider is open at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub provider_id: String,
    pub severity: IncidentSeverity,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub triggering_status: HealthState,
    /// Providers flagged by the cascade walk when this incident opened
    pub affected_dependents: Vec<String>,
}

impl Incident {
    pub fn open(
        provider_id: impl Into<String>,
        severity: IncidentSeverity,
        triggering_status: HealthState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider_id: provider_id.into(),
            severity,
            opened_at: now,
            closed_at: None,
            triggering_status,
            affected_dependents: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}
