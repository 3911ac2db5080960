//! Replay and rate guard
//!
//! Both checks are single atomic operations against the shared store so that
//! several HookGuard processes can run side by side:
//! - replay: `SET NX EX` on `replay:<provider>:<event>` with a TTL of twice
//!   the provider's timestamp tolerance
//! - rate: `INCR` on `rate:<provider>:<source>:<window index>`, expiring with
//!   the window
//!
//! When the store is unreachable both checks fail open. Replay protection
//! failing open is logged and audited as a security degradation, unless the
//! provider opted into `replay_fail_closed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use hg_common::audit::record_best_effort;
use hg_common::{
    AuditAction, AuditRecord, AuditSeverity, AuditSink, ProviderConfig, Result, SecurityViolation, SharedClock,
    VerificationResult,
};
use hg_store::SharedStore;

/// Marker lifetime for providers that have no timestamp tolerance configured
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const ACTOR: &str = "replay-rate-guard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds until the current window closes, at least one
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(1) as u64
    }
}

pub struct ReplayAndRateGuard {
    store: SharedStore,
    audit: Arc<dyn AuditSink>,
    clock: SharedClock,
}

impl ReplayAndRateGuard {
    pub fn new(store: SharedStore, audit: Arc<dyn AuditSink>, clock: SharedClock) -> Self {
        Self { store, audit, clock }
    }

    pub fn replay_ttl(tolerance_secs: Option<u64>) -> Duration {
        tolerance_secs
            .map(|t| Duration::from_secs(t.saturating_mul(2)))
            .unwrap_or(DEFAULT_REPLAY_WINDOW)
    }

    /// `true` when the event was already seen. Fails open on store errors.
    pub async fn check_replay(
        &self,
        provider_id: &str,
        event_id: &str,
        timestamp: Option<i64>,
        tolerance_secs: Option<u64>,
    ) -> Result<bool> {
        self.replay_inner(provider_id, event_id, timestamp, tolerance_secs, false)
            .await
    }

    /// Replay check under the provider's own policy, including `replay_fail_closed`
    pub async fn check_replay_for(
        &self,
        provider: &ProviderConfig,
        event_id: &str,
        timestamp: Option<i64>,
    ) -> Result<bool> {
        self.replay_inner(
            &provider.provider_id,
            event_id,
            timestamp,
            provider.timestamp_tolerance_secs,
            provider.replay_fail_closed,
        )
        .await
    }

    /// Remove a replay marker for an event that was accepted but could not be
    /// queued, so the provider's own redelivery is not mistaken for a replay
    pub async fn forget_replay(&self, provider_id: &str, event_id: &str) {
        let key = format!("replay:{}:{}", provider_id, event_id);
        if let Err(e) = self.store.delete(&key).await {
            warn!(provider_id = %provider_id, event_id = %event_id, error = %e, "Failed to clear replay marker");
        }
    }

    /// Mark a verified result as a replay when its event id was already seen
    pub async fn screen(
        &self,
        provider: &ProviderConfig,
        result: VerificationResult,
        timestamp: Option<i64>,
    ) -> Result<VerificationResult> {
        if !result.valid || !provider.replay_protection {
            return Ok(result);
        }
        let Some(event_id) = result.extracted_event_id.as_deref() else {
            return Ok(result);
        };
        if self.check_replay_for(provider, event_id, timestamp).await? {
            Ok(result.as_replay())
        } else {
            Ok(result)
        }
    }

    async fn replay_inner(
        &self,
        provider_id: &str,
        event_id: &str,
        timestamp: Option<i64>,
        tolerance_secs: Option<u64>,
        fail_closed: bool,
    ) -> Result<bool> {
        let key = format!("replay:{}:{}", provider_id, event_id);
        let seen_at = timestamp.unwrap_or_else(|| self.clock.now().timestamp());
        let ttl = Self::replay_ttl(tolerance_secs);

        match self.store.set_nx_ex(&key, &seen_at.to_string(), ttl).await {
            Ok(true) => {
                debug!(provider_id = %provider_id, event_id = %event_id, ttl_secs = ttl.as_secs(), "Replay marker set");
                Ok(false)
            }
            Ok(false) => {
                metrics::counter!("hookguard_replays_total", "provider" => provider_id.to_string()).increment(1);
                warn!(provider_id = %provider_id, event_id = %event_id, "Replay detected");
                record_best_effort(
                    &self.audit,
                    AuditRecord::new(
                        AuditAction::ReplayDetected,
                        AuditSeverity::High,
                        "WebhookEvent",
                        event_id,
                        json!({ "providerId": provider_id }),
                        ACTOR,
                    ),
                )
                .await;
                Ok(true)
            }
            Err(e) => {
                error!(
                    provider_id = %provider_id,
                    event_id = %event_id,
                    error = %e,
                    fail_closed = fail_closed,
                    security_degradation = true,
                    "Replay protection unavailable"
                );
                record_best_effort(
                    &self.audit,
                    AuditRecord::new(
                        AuditAction::ReplayProtectionDegraded,
                        AuditSeverity::High,
                        "WebhookEvent",
                        event_id,
                        json!({
                            "providerId": provider_id,
                            "error": e.to_string(),
                            "failClosed": fail_closed,
                        }),
                        ACTOR,
                    ),
                )
                .await;

                if fail_closed {
                    Err(SecurityViolation::ReplayProtectionUnavailable.into())
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Fixed-window counter per (provider, source). Never fails: an
    /// unreachable store allows the request.
    pub async fn check_rate_limit(
        &self,
        provider_id: &str,
        source_identifier: &str,
        window: Duration,
        max_requests: u64,
    ) -> RateLimitDecision {
        let window_secs = window.as_secs().max(1) as i64;
        let now = self.clock.now().timestamp();
        let window_index = now.div_euclid(window_secs);
        let reset_at = DateTime::<Utc>::from_timestamp((window_index + 1) * window_secs, 0).unwrap_or_default();
        let key = format!("rate:{}:{}:{}", provider_id, source_identifier, window_index);

        let count = match self.store.incr_with_expiry(&key, Duration::from_secs(window_secs as u64)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    provider_id = %provider_id,
                    source = %source_identifier,
                    error = %e,
                    "Rate limiting unavailable, allowing request"
                );
                record_best_effort(
                    &self.audit,
                    AuditRecord::new(
                        AuditAction::RateLimitDegraded,
                        AuditSeverity::Warning,
                        "Provider",
                        provider_id,
                        json!({ "source": source_identifier, "error": e.to_string() }),
                        ACTOR,
                    ),
                )
                .await;
                return RateLimitDecision {
                    allowed: true,
                    remaining: max_requests,
                    reset_at,
                };
            }
        };

        let allowed = count <= max_requests;
        if !allowed {
            metrics::counter!("hookguard_rate_limited_total", "provider" => provider_id.to_string()).increment(1);
            warn!(
                provider_id = %provider_id,
                source = %source_identifier,
                count = count,
                max_requests = max_requests,
                "Rate limit exceeded"
            );
            record_best_effort(
                &self.audit,
                AuditRecord::new(
                    AuditAction::RateLimited,
                    AuditSeverity::Warning,
                    "Provider",
                    provider_id,
                    json!({
                        "source": source_identifier,
                        "count": count,
                        "maxRequests": max_requests,
                        "windowIndex": window_index,
                    }),
                    ACTOR,
                ),
            )
            .await;
        }

        RateLimitDecision {
            allowed,
            remaining: max_requests.saturating_sub(count),
            reset_at,
        }
    }
}
