//! WebhookCoordinator - intake, deduplication and processing of inbound events
//!
//! Per event:
//! `Received -> SecurityValidated -> DedupChecked -> (Duplicate | Accepted)`,
//! then a "received" broadcast, then background queueing (plus an immediate
//! synchronous attempt for critical event types), ending in `Completed` or
//! `Failed`. Transient failures re-enter through a timer until the retry
//! policy gives up.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use hg_broadcast::{MessagePriority, RealtimeBroadcastHub, ROOM_WEBHOOK_EVENTS};
use hg_common::audit::record_best_effort;
use hg_common::{
    AuditAction, AuditRecord, AuditSeverity, AuditSink, ErrorKind, HookGuardError, InboundEvent, InboundRequest,
    ProcessingOutcome, ProviderConfig, Result, SecurityViolation, SharedClock,
};
use hg_config::{ConfigStore, GuardConfig};
use hg_guard::ReplayAndRateGuard;
use hg_health::{Observation, ServiceHealthRegistry};
use hg_store::{KvStore, SharedStore};
use hg_verify::{lookup_path, resolve_event_id, SignatureVerifier};

use crate::handler::{EventHandler, HandlerError};
use crate::ledger::{AppendResult, OutcomeLedger};
use crate::pool::{PoolClass, PoolConfig, PoolJob, PoolStats, WorkerPool};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::{shape, CoordinatorError};

const ACTOR: &str = "webhook-coordinator";
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How an accepted event was handled before the response went out
#[derive(Debug, Clone, PartialEq)]
pub enum Processing {
    /// Critical event: processed synchronously, outcome of that first attempt
    Immediate(ProcessingOutcome),
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestResponse {
    Accepted { event_id: String, processing: Processing },
    /// Already seen; carries the recorded outcome when there is one
    Duplicate { event_id: String, previous: Option<ProcessingOutcome> },
}

impl IngestResponse {
    pub fn event_id(&self) -> &str {
        match self {
            IngestResponse::Accepted { event_id, .. } | IngestResponse::Duplicate { event_id, .. } => event_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestResponse::Duplicate { .. })
    }
}

/// Everything the coordinator talks to, built by the caller
pub struct Collaborators {
    pub config: Arc<ConfigStore>,
    pub verifier: Arc<SignatureVerifier>,
    pub guard: Arc<ReplayAndRateGuard>,
    pub health: Arc<ServiceHealthRegistry>,
    pub hub: Arc<RealtimeBroadcastHub>,
    pub handler: Arc<dyn EventHandler>,
    pub audit: Arc<dyn AuditSink>,
    pub store: SharedStore,
    pub clock: SharedClock,
}

pub struct WebhookCoordinator {
    config: Arc<ConfigStore>,
    verifier: Arc<SignatureVerifier>,
    guard: Arc<ReplayAndRateGuard>,
    health: Arc<ServiceHealthRegistry>,
    hub: Arc<RealtimeBroadcastHub>,
    handler: Arc<dyn EventHandler>,
    audit: Arc<dyn AuditSink>,
    clock: SharedClock,
    store: SharedStore,

    ledger: OutcomeLedger,
    critical_pool: WorkerPool,
    standard_pool: WorkerPool,

    /// Events accepted and not yet terminal, keyed `provider:event`
    in_pipeline: DashMap<String, DateTime<Utc>>,

    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    pending_retries: AtomicU32,
}

fn pipeline_key(provider_id: &str, event_id: &str) -> String {
    format!("{}:{}", provider_id, event_id)
}

/// Shared-store key held by the instance processing an event
pub fn claim_key(provider_id: &str, event_id: &str) -> String {
    format!("claim:{}:{}", provider_id, event_id)
}

/// Result of reserving an event for processing
enum Claim {
    Fresh,
    /// An earlier run stopped with a retry pending; continue at `attempt`
    Resume { attempt: u32 },
    Duplicate(IngestResponse),
}

impl WebhookCoordinator {
    /// Build the coordinator and start its worker pools. Must run inside a
    /// Tokio runtime.
    pub fn new(parts: Collaborators) -> Arc<Self> {
        let snapshot = parts.config.current();
        let settings = &snapshot.coordinator;

        let critical_pool = WorkerPool::new(PoolConfig {
            class: PoolClass::Critical,
            concurrency: settings.critical_concurrency,
            rate_limit_per_minute: None,
        });
        let standard_pool = WorkerPool::new(PoolConfig {
            class: PoolClass::Standard,
            concurrency: settings.standard_concurrency,
            rate_limit_per_minute: settings.standard_rate_limit_per_minute,
        });
        critical_pool.start();
        standard_pool.start();

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            critical_concurrency = settings.critical_concurrency,
            standard_concurrency = settings.standard_concurrency,
            max_attempts = settings.max_attempts,
            "Webhook coordinator started"
        );

        Arc::new(Self {
            ledger: OutcomeLedger::new(parts.store.clone(), settings.outcome_ttl()),
            store: parts.store,
            config: parts.config,
            verifier: parts.verifier,
            guard: parts.guard,
            health: parts.health,
            hub: parts.hub,
            handler: parts.handler,
            audit: parts.audit,
            clock: parts.clock,
            critical_pool,
            standard_pool,
            in_pipeline: DashMap::new(),
            running: AtomicBool::new(true),
            shutdown_tx,
            pending_retries: AtomicU32::new(0),
        })
    }

    /// Run the synchronous part of processing for one inbound request.
    ///
    /// Security and validation failures come back as errors and are never
    /// retried. Handler failures never surface here; they are retried in the
    /// background and end up in the ledger, the audit trail and the health
    /// registry.
    pub async fn ingest(self: &Arc<Self>, request: InboundRequest) -> Result<IngestResponse> {
        if !self.is_running() {
            return Err(CoordinatorError::ShuttingDown.into());
        }

        let snapshot = self.config.current();
        let Some(provider) = snapshot.provider(&request.provider_id) else {
            warn!(provider_id = %request.provider_id, "Webhook for unconfigured provider");
            metrics::counter!("hookguard_webhooks_total", "provider" => "unknown", "outcome" => "rejected").increment(1);
            return Err(HookGuardError::unconfigured_provider(&request.provider_id));
        };

        match self.admit(&snapshot, provider, &request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.record_rejection(provider, &request, &e).await;
                Err(e)
            }
        }
    }

    async fn admit(
        self: &Arc<Self>,
        snapshot: &GuardConfig,
        provider: &ProviderConfig,
        request: &InboundRequest,
    ) -> Result<IngestResponse> {
        if let Some(limit) = provider.rate_limit {
            let source = request.source_identifier.as_deref().unwrap_or("anonymous");
            let decision = self
                .guard
                .check_rate_limit(
                    &provider.provider_id,
                    source,
                    Duration::from_secs(limit.window_secs),
                    limit.max_requests,
                )
                .await;
            if !decision.allowed {
                return Err(HookGuardError::RateLimited {
                    retry_after_secs: decision.retry_after_secs(self.clock.now()),
                });
            }
        }

        if request.raw_body.len() > provider.max_payload_bytes {
            return Err(SecurityViolation::PayloadTooLarge {
                size: request.raw_body.len(),
                limit: provider.max_payload_bytes,
            }
            .into());
        }

        self.verifier.authenticate(provider, request)?;
        let payload = shape::parse_and_validate(provider, request, snapshot.coordinator.max_json_depth)?;

        let event_id = resolve_event_id(&provider.provider_id, &request.raw_body, Some(&payload), &provider.event_id_field);
        let event_type = lookup_path(&payload, &provider.event_type_field)
            .and_then(Value::as_str)
            .map(String::from);

        let first_attempt = match self.claim(provider, &event_id, request).await? {
            Claim::Fresh => 0,
            Claim::Resume { attempt } => attempt,
            Claim::Duplicate(duplicate) => return Ok(duplicate),
        };

        let received_at = self.clock.now();
        let critical = provider.is_critical_event(event_type.as_deref());
        let event = Arc::new(InboundEvent {
            provider_id: provider.provider_id.clone(),
            event_id: event_id.clone(),
            event_type,
            raw_payload: request.raw_body.clone(),
            payload,
            headers: request.headers.clone(),
            received_at,
        });

        info!(
            provider_id = %event.provider_id,
            event_id = %event.event_id,
            event_type = ?event.event_type,
            critical = critical,
            attempt = first_attempt,
            "Webhook accepted"
        );
        metrics::counter!("hookguard_webhooks_total", "provider" => provider.provider_id.clone(), "outcome" => "accepted")
            .increment(1);
        record_best_effort(
            &self.audit,
            AuditRecord::new(
                AuditAction::WebhookAccepted,
                AuditSeverity::Info,
                "WebhookEvent",
                &event.event_id,
                json!({
                    "providerId": event.provider_id,
                    "eventType": event.event_type,
                    "critical": critical,
                    "attempt": first_attempt,
                }),
                ACTOR,
            ),
        )
        .await;

        self.notify_received(&event, critical);

        if critical {
            let outcome = self.attempt(event.clone(), PoolClass::Critical, first_attempt).await;
            self.queue_reconciliation(event);
            return Ok(IngestResponse::Accepted {
                event_id,
                processing: Processing::Immediate(outcome),
            });
        }

        if let Err(e) = self.enqueue(event.clone(), PoolClass::Standard, first_attempt) {
            // Nothing ran; let the provider's own redelivery through
            self.release(&event.provider_id, &event.event_id).await;
            self.guard.forget_replay(&event.provider_id, &event.event_id).await;
            return Err(e.into());
        }

        Ok(IngestResponse::Accepted {
            event_id,
            processing: Processing::Queued,
        })
    }

    /// Reserve the event for processing, or report it as a duplicate.
    ///
    /// Two reservations are taken: an in-process one, then an atomic claim in
    /// the shared store that every instance competes for. Terminal outcomes
    /// are written before either is released, so every duplicate sees the
    /// claim or the outcome. A non-terminal latest outcome means an earlier
    /// run stopped with a retry pending; processing resumes from there.
    async fn claim(&self, provider: &ProviderConfig, event_id: &str, request: &InboundRequest) -> Result<Claim> {
        let key = pipeline_key(&provider.provider_id, event_id);
        let reserved = match self.in_pipeline.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(self.clock.now());
                true
            }
        };
        if !reserved {
            debug!(provider_id = %provider.provider_id, event_id = %event_id, "Event already in pipeline");
            return Ok(Claim::Duplicate(self.duplicate(provider, event_id, None).await));
        }

        match self.acquire_shared_claim(provider, event_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.in_pipeline.remove(&key);
                debug!(provider_id = %provider.provider_id, event_id = %event_id, "Event claimed by another instance");
                let previous = self.ledger.latest(&provider.provider_id, event_id).await;
                return Ok(Claim::Duplicate(self.duplicate(provider, event_id, previous).await));
            }
            Err(e) => {
                self.in_pipeline.remove(&key);
                return Err(e);
            }
        }

        if let Some(previous) = self.ledger.latest(&provider.provider_id, event_id).await {
            if previous.success || previous.is_exhausted() {
                self.release(&provider.provider_id, event_id).await;
                return Ok(Claim::Duplicate(self.duplicate(provider, event_id, Some(previous)).await));
            }
            info!(
                provider_id = %provider.provider_id,
                event_id = %event_id,
                attempt = previous.retry_count + 1,
                "Resuming event left with a pending retry"
            );
            return Ok(Claim::Resume {
                attempt: previous.retry_count + 1,
            });
        }

        if provider.replay_protection {
            let timestamp = provider
                .timestamp_header
                .as_deref()
                .and_then(|name| request.header(name))
                .and_then(|raw| raw.trim().parse::<i64>().ok());

            match self.guard.check_replay_for(provider, event_id, timestamp).await {
                Ok(false) => {}
                Ok(true) => {
                    self.release(&provider.provider_id, event_id).await;
                    let previous = self.ledger.latest(&provider.provider_id, event_id).await;
                    return Ok(Claim::Duplicate(self.duplicate(provider, event_id, previous).await));
                }
                Err(e) => {
                    self.release(&provider.provider_id, event_id).await;
                    return Err(e);
                }
            }
        }

        Ok(Claim::Fresh)
    }

    /// `SET NX EX` on the event's claim key. An unreachable store lets the
    /// event through unless the provider fails closed.
    async fn acquire_shared_claim(&self, provider: &ProviderConfig, event_id: &str) -> Result<bool> {
        let key = claim_key(&provider.provider_id, event_id);
        let ttl = self.config.current().coordinator.claim_ttl();
        let holder = self.clock.now().timestamp().to_string();

        let error = match self.store.set_nx_ex(&key, &holder, ttl).await {
            Ok(acquired) => return Ok(acquired),
            Err(e) => e,
        };
        record_best_effort(
            &self.audit,
            AuditRecord::new(
                AuditAction::ReplayProtectionDegraded,
                AuditSeverity::High,
                "WebhookEvent",
                event_id,
                json!({
                    "providerId": provider.provider_id,
                    "stage": "processing_claim",
                    "failClosed": provider.replay_fail_closed,
                    "error": error.to_string(),
                }),
                ACTOR,
            ),
        )
        .await;

        if provider.replay_fail_closed {
            error!(
                provider_id = %provider.provider_id,
                event_id = %event_id,
                error = %error,
                security_degradation = true,
                "Processing claim unavailable, rejecting"
            );
            return Err(SecurityViolation::ReplayProtectionUnavailable.into());
        }
        warn!(
            provider_id = %provider.provider_id,
            event_id = %event_id,
            error = %error,
            security_degradation = true,
            "Processing claim unavailable, continuing with in-process reservation"
        );
        Ok(true)
    }

    /// Drop both reservations for an event
    async fn release(&self, provider_id: &str, event_id: &str) {
        if let Err(e) = self.store.delete(&claim_key(provider_id, event_id)).await {
            warn!(provider_id = %provider_id, event_id = %event_id, error = %e, "Failed to release processing claim");
        }
        self.in_pipeline.remove(&pipeline_key(provider_id, event_id));
    }

    async fn duplicate(
        &self,
        provider: &ProviderConfig,
        event_id: &str,
        previous: Option<ProcessingOutcome>,
    ) -> IngestResponse {
        info!(provider_id = %provider.provider_id, event_id = %event_id, "Duplicate delivery");
        metrics::counter!("hookguard_webhooks_total", "provider" => provider.provider_id.clone(), "outcome" => "duplicate")
            .increment(1);
        record_best_effort(
            &self.audit,
            AuditRecord::new(
                AuditAction::WebhookDuplicate,
                AuditSeverity::Info,
                "WebhookEvent",
                event_id,
                json!({
                    "providerId": provider.provider_id,
                    "previousSuccess": previous.as_ref().map(|o| o.success),
                }),
                ACTOR,
            ),
        )
        .await;

        IngestResponse::Duplicate {
            event_id: event_id.to_string(),
            previous,
        }
    }

    async fn record_rejection(&self, provider: &ProviderConfig, request: &InboundRequest, error: &HookGuardError) {
        let outcome = match error.kind() {
            ErrorKind::RateLimited => "rate_limited",
            _ => "rejected",
        };
        metrics::counter!("hookguard_webhooks_total", "provider" => provider.provider_id.clone(), "outcome" => outcome)
            .increment(1);

        let severity = match error.kind() {
            // Counted and audited by the guard already
            ErrorKind::RateLimited => return,
            ErrorKind::SecurityViolation => AuditSeverity::High,
            _ => AuditSeverity::Warning,
        };

        warn!(
            provider_id = %provider.provider_id,
            source = ?request.source_identifier,
            kind = ?error.kind(),
            error = %error,
            "Webhook rejected"
        );
        record_best_effort(
            &self.audit,
            AuditRecord::new(
                AuditAction::WebhookRejected,
                severity,
                "Provider",
                &provider.provider_id,
                json!({
                    "kind": error.kind(),
                    "reason": error.to_string(),
                    "source": request.source_identifier,
                    "bytes": request.raw_body.len(),
                }),
                ACTOR,
            ),
        )
        .await;
    }

    fn notify_received(&self, event: &InboundEvent, critical: bool) {
        let priority = if critical { MessagePriority::High } else { MessagePriority::Normal };
        let message = self.hub.message(
            ROOM_WEBHOOK_EVENTS,
            "webhook_received",
            json!({
                "providerId": event.provider_id,
                "eventId": event.event_id,
                "eventType": event.event_type,
                "critical": critical,
                "receivedAt": event.received_at.to_rfc3339(),
            }),
            priority,
        );
        let report = self.hub.broadcast(message);
        debug!(event_id = %event.event_id, delivered = report.delivered, "Received notification sent");
    }

    fn pool(&self, class: PoolClass) -> &WorkerPool {
        match class {
            PoolClass::Critical => &self.critical_pool,
            PoolClass::Standard => &self.standard_pool,
        }
    }

    fn enqueue(self: &Arc<Self>, event: Arc<InboundEvent>, class: PoolClass, attempt: u32) -> std::result::Result<(), CoordinatorError> {
        let this = self.clone();
        let job = PoolJob {
            provider_id: event.provider_id.clone(),
            event_id: event.event_id.clone(),
            work: async move {
                this.attempt(event, class, attempt).await;
            }
            .boxed(),
        };
        self.pool(class).submit(job)
    }

    /// Background check that the critical event's latest outcome reached the
    /// shared store
    fn queue_reconciliation(self: &Arc<Self>, event: Arc<InboundEvent>) {
        let this = self.clone();
        let job = PoolJob {
            provider_id: event.provider_id.clone(),
            event_id: event.event_id.clone(),
            work: async move {
                if this.ledger.reconcile(&event.provider_id, &event.event_id).await {
                    metrics::counter!("hookguard_outcomes_reconciled_total", "provider" => event.provider_id.clone())
                        .increment(1);
                }
            }
            .boxed(),
        };
        if let Err(e) = self.critical_pool.submit(job) {
            warn!(error = %e, "Reconciliation not queued");
        }
    }

    /// One handler invocation under the hard timeout. Returns the outcome
    /// appended to the ledger for this attempt.
    async fn attempt(self: &Arc<Self>, event: Arc<InboundEvent>, class: PoolClass, attempt: u32) -> ProcessingOutcome {
        let settings = self.config.current().coordinator.clone();
        let policy = RetryPolicy::from_settings(&settings);
        let timeout = settings.handler_timeout();

        let started = Instant::now();
        let result = self.invoke_handler(event.clone(), timeout).await;
        let latency = started.elapsed();
        let elapsed_ms = latency.as_millis() as u64;

        let error = match result {
            Ok(()) => {
                let mut outcome = ProcessingOutcome::succeeded(&event.event_id, &event.provider_id, elapsed_ms, attempt);
                outcome.recorded_at = self.clock.now();
                return self.finish(&event, outcome, latency).await;
            }
            Err(error) => error,
        };

        match policy.decide(attempt, error.is_transient()) {
            RetryDecision::Retry { delay, next_attempt } => {
                let now = self.clock.now();
                let next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d).unwrap_or(now);
                let mut outcome = ProcessingOutcome::failed(
                    &event.event_id,
                    &event.provider_id,
                    elapsed_ms,
                    attempt,
                    Some(next_retry_at),
                    error.to_string(),
                );
                outcome.recorded_at = now;
                self.ledger.append(outcome.clone()).await;

                if !self.schedule_retry(event.clone(), class, next_attempt, delay) {
                    self.park(&event, next_attempt).await;
                    return outcome;
                }

                warn!(
                    provider_id = %event.provider_id,
                    event_id = %event.event_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Handler failed, retry scheduled"
                );
                metrics::counter!("hookguard_retries_total", "provider" => event.provider_id.clone()).increment(1);
                record_best_effort(
                    &self.audit,
                    AuditRecord::new(
                        AuditAction::RetryScheduled,
                        AuditSeverity::Warning,
                        "WebhookEvent",
                        &event.event_id,
                        json!({
                            "providerId": event.provider_id,
                            "attempt": attempt,
                            "nextRetryAt": next_retry_at.to_rfc3339(),
                            "error": error.to_string(),
                        }),
                        ACTOR,
                    ),
                )
                .await;

                outcome
            }
            RetryDecision::GiveUp => {
                let mut outcome = ProcessingOutcome::failed(
                    &event.event_id,
                    &event.provider_id,
                    elapsed_ms,
                    attempt,
                    None,
                    error.to_string(),
                );
                outcome.recorded_at = self.clock.now();
                self.finish(&event, outcome, latency).await
            }
        }
    }

    /// Handler call on its own task so a panic or a hang becomes a failure
    async fn invoke_handler(&self, event: Arc<InboundEvent>, timeout: Duration) -> std::result::Result<(), HandlerError> {
        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            handler
                .handle_verified_event(&event.provider_id, &event.event_id, &event.payload)
                .await
        });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(HandlerError::Permanent(format!("handler panicked: {}", join_error))),
            Err(_) => {
                abort.abort();
                Err(HandlerError::Transient(format!("handler timed out after {}ms", timeout.as_millis())))
            }
        }
    }

    /// Timer-based re-enqueue; cancelled by shutdown. Returns false when
    /// the coordinator has already stopped and nothing was scheduled.
    fn schedule_retry(self: &Arc<Self>, event: Arc<InboundEvent>, class: PoolClass, next_attempt: u32, delay: Duration) -> bool {
        // Subscribe before the check so a concurrent shutdown is never missed
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.is_running() {
            return false;
        }

        self.pending_retries.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match this.enqueue(event.clone(), class, next_attempt) {
                        Ok(()) => {}
                        Err(CoordinatorError::PoolSaturated { pool }) => {
                            warn!(event_id = %event.event_id, pool = pool, "Pool saturated, retry deferred");
                            if !this.schedule_retry(event.clone(), class, next_attempt, delay) {
                                this.park(&event, next_attempt).await;
                            }
                        }
                        Err(CoordinatorError::ShuttingDown) => this.park(&event, next_attempt).await,
                    }
                    this.pending_retries.fetch_sub(1, Ordering::SeqCst);
                }
                _ = shutdown_rx.recv() => {
                    this.park(&event, next_attempt).await;
                    this.pending_retries.fetch_sub(1, Ordering::SeqCst);
                }
            }
        });
        true
    }

    /// Stop working on an event whose latest outcome still has a retry
    /// pending. The outcome stays non-terminal; a redelivery resumes it.
    async fn park(&self, event: &InboundEvent, next_attempt: u32) {
        self.release(&event.provider_id, &event.event_id).await;
        warn!(
            provider_id = %event.provider_id,
            event_id = %event.event_id,
            attempt = next_attempt,
            "Retry dropped by shutdown, left for redelivery"
        );
        metrics::counter!("hookguard_retries_dropped_total", "provider" => event.provider_id.clone()).increment(1);
    }

    /// Terminal state: durable ledger write first, then release the event and
    /// report to audit, health and observers
    async fn finish(&self, event: &InboundEvent, outcome: ProcessingOutcome, latency: Duration) -> ProcessingOutcome {
        let appended = self.ledger.append(outcome.clone()).await;
        self.release(&event.provider_id, &event.event_id).await;
        if appended == AppendResult::RejectedDuplicateSuccess {
            return outcome;
        }

        let result = if outcome.success { "completed" } else { "failed" };
        metrics::counter!(
            "hookguard_events_processed_total",
            "provider" => event.provider_id.clone(),
            "result" => result
        )
        .increment(1);

        if outcome.success {
            info!(
                provider_id = %event.provider_id,
                event_id = %event.event_id,
                attempts = outcome.retry_count + 1,
                processing_time_ms = outcome.processing_time_ms,
                "Event completed"
            );
        } else {
            error!(
                provider_id = %event.provider_id,
                event_id = %event.event_id,
                attempts = outcome.retry_count + 1,
                error = ?outcome.error,
                "Event failed"
            );
        }

        let (action, severity) = if outcome.success {
            (AuditAction::EventCompleted, AuditSeverity::Info)
        } else {
            (AuditAction::EventFailed, AuditSeverity::Warning)
        };
        record_best_effort(
            &self.audit,
            AuditRecord::new(
                action,
                severity,
                "WebhookEvent",
                &event.event_id,
                json!({
                    "providerId": event.provider_id,
                    "eventType": event.event_type,
                    "attempts": outcome.retry_count + 1,
                    "processingTimeMs": outcome.processing_time_ms,
                    "error": outcome.error,
                }),
                ACTOR,
            ),
        )
        .await;

        let observation = match &outcome.error {
            None => Observation::success(latency),
            Some(error) => Observation::failure(latency, error.clone()),
        };
        if let Err(e) = self.health.record(&event.provider_id, observation).await {
            debug!(provider_id = %event.provider_id, error = %e, "Outcome not reported to health registry");
        }

        let message_type = if outcome.success { "webhook_processed" } else { "webhook_failed" };
        let priority = if outcome.success { MessagePriority::Normal } else { MessagePriority::High };
        self.hub.broadcast(self.hub.message(
            ROOM_WEBHOOK_EVENTS,
            message_type,
            json!({
                "providerId": event.provider_id,
                "eventId": event.event_id,
                "eventType": event.event_type,
                "attempts": outcome.retry_count + 1,
                "processingTimeMs": outcome.processing_time_ms,
                "error": outcome.error,
            }),
            priority,
        ));

        outcome
    }

    /// Stop intake, cancel pending retry timers and wait for queued and
    /// running work to reach a terminal write, up to the drain timeout
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            in_pipeline = self.in_pipeline.len(),
            pending_retries = self.pending_retries(),
            "Initiating coordinator shutdown"
        );

        let _ = self.shutdown_tx.send(());
        self.critical_pool.drain();
        self.standard_pool.drain();

        let timeout = self.config.current().coordinator.shutdown_drain_timeout();
        let started = Instant::now();
        loop {
            if self.all_pools_drained() && self.pending_retries() == 0 {
                info!("All worker pools drained");
                break;
            }
            if started.elapsed() >= timeout {
                warn!(
                    critical = ?self.critical_pool.get_stats(),
                    standard = ?self.standard_pool.get_stats(),
                    "Drain timeout reached, abandoning remaining work"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("Coordinator shutdown complete");
    }

    pub fn all_pools_drained(&self) -> bool {
        self.critical_pool.is_fully_drained() && self.standard_pool.is_fully_drained()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pending_retries(&self) -> u32 {
        self.pending_retries.load(Ordering::SeqCst)
    }

    pub fn in_pipeline_count(&self) -> usize {
        self.in_pipeline.len()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        vec![self.critical_pool.get_stats(), self.standard_pool.get_stats()]
    }

    /// Full processing trail of an event in this process
    pub fn outcomes(&self, provider_id: &str, event_id: &str) -> Vec<ProcessingOutcome> {
        self.ledger.history(provider_id, event_id)
    }

    pub async fn latest_outcome(&self, provider_id: &str, event_id: &str) -> Option<ProcessingOutcome> {
        self.ledger.latest(provider_id, event_id).await
    }

    pub fn ledger(&self) -> &OutcomeLedger {
        &self.ledger
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn health(&self) -> &Arc<ServiceHealthRegistry> {
        &self.health
    }

    pub fn hub(&self) -> &Arc<RealtimeBroadcastHub> {
        &self.hub
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}
