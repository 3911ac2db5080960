//! Service health registry
//!
//! Owns the health state of every configured provider. Status only changes
//! through observations (probe results, outbound calls, event outcomes) or
//! the operator's disable/enable; callers never set a state directly.
//!
//! Each provider's state sits behind its own async mutex, so concurrent
//! observations for one provider are applied one at a time while different
//! providers never wait on each other. Cascade flags are stored per
//! dependent, outside the provider locks, so a walk never needs two
//! provider locks at once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use hg_common::audit::record_best_effort;
use hg_common::{
    AuditAction, AuditRecord, AuditSeverity, AuditSink, CascadeFlag, CascadeRisk, HealthState, HookGuardError,
    Incident, ProviderConfig, Result, ServiceHealthStatus, SharedClock,
};
use hg_config::ConfigStore;
use hg_store::SharedStore;

pub mod incidents;
pub mod probe;
pub mod state;

pub use incidents::{cascade_targets, IncidentBook, IncidentChange};
pub use probe::{run_probe, HealthProbe, HttpProbe};
pub use state::{Observation, ProviderHealth, Thresholds, Transition};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const INCIDENT_HISTORY: usize = 500;
const ACTOR: &str = "health-registry";

/// Typed notifications published on every status change
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    Transition {
        provider_id: String,
        from: HealthState,
        to: HealthState,
        status: ServiceHealthStatus,
    },
    IncidentOpened(Incident),
    IncidentEscalated(Incident),
    IncidentClosed(Incident),
    CascadeFlagged {
        source_provider: String,
        risk: CascadeRisk,
        dependents: Vec<String>,
    },
    CascadeCleared {
        source_provider: String,
        dependents: Vec<String>,
    },
}

pub fn snapshot_key(provider_id: &str) -> String {
    format!("health:snapshot:{}", provider_id)
}

pub struct ServiceHealthRegistry {
    config: Arc<ConfigStore>,
    clock: SharedClock,
    audit: Arc<dyn AuditSink>,
    providers: DashMap<String, Arc<Mutex<ProviderHealth>>>,
    incidents: SyncMutex<IncidentBook>,
    /// dependent -> (source provider -> flag)
    cascade: DashMap<String, BTreeMap<String, CascadeFlag>>,
    events: broadcast::Sender<HealthEvent>,
    snapshots: Option<SharedStore>,
}

impl ServiceHealthRegistry {
    pub fn new(config: Arc<ConfigStore>, audit: Arc<dyn AuditSink>, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            clock,
            audit,
            providers: DashMap::new(),
            incidents: SyncMutex::new(IncidentBook::new(INCIDENT_HISTORY)),
            cascade: DashMap::new(),
            events,
            snapshots: None,
        }
    }

    /// Mirror status changes into the shared store for other instances
    pub fn with_snapshot_store(mut self, store: SharedStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    fn slot(&self, provider_id: &str) -> Result<Arc<Mutex<ProviderHealth>>> {
        let snapshot = self.config.current();
        if snapshot.provider(provider_id).is_none() {
            return Err(HookGuardError::unconfigured_provider(provider_id));
        }
        let window = snapshot.health.rolling_window;
        let now = self.clock.now();
        let slot = self
            .providers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new(provider_id, window, now))))
            .clone();
        Ok(slot)
    }

    pub async fn record_success(&self, provider_id: &str, latency: Duration) -> Result<ServiceHealthStatus> {
        self.record(provider_id, Observation::success(latency)).await
    }

    pub async fn record_failure(
        &self,
        provider_id: &str,
        latency: Duration,
        error: impl Into<String>,
    ) -> Result<ServiceHealthStatus> {
        self.record(provider_id, Observation::failure(latency, error)).await
    }

    /// Apply one observation and everything that follows from it
    pub async fn record(&self, provider_id: &str, observation: Observation) -> Result<ServiceHealthStatus> {
        let slot = self.slot(provider_id)?;
        let snapshot = self.config.current();
        let provider = snapshot
            .provider(provider_id)
            .ok_or_else(|| HookGuardError::unconfigured_provider(provider_id))?;
        let thresholds = Thresholds::from_settings(&snapshot.health, provider.warning_latency_ms);

        let (status, audits, changed) = {
            let mut health = slot.lock().await;
            let now = self.clock.now();
            let transition = health.observe(&observation, &thresholds, now);
            let status = health.status().clone();
            match transition {
                Some(transition) => {
                    let audits = self.apply_transition(provider, transition, &status, now);
                    (status, audits, true)
                }
                None => (status, Vec::new(), false),
            }
        };

        if changed {
            self.write_snapshot(&status).await;
        }
        for record in audits {
            record_best_effort(&self.audit, record).await;
        }
        Ok(self.with_flags(status))
    }

    /// Run a probe under the configured timeout and record its result
    pub async fn probe(&self, provider_id: &str, probe: Arc<dyn HealthProbe>) -> Result<ServiceHealthStatus> {
        let timeout = self.config.current().health.probe_timeout();
        let observation = run_probe(probe, timeout).await;
        if let Some(error) = &observation.error {
            debug!(provider_id = %provider_id, error = %error, "Probe failed");
        }
        self.record(provider_id, observation).await
    }

    /// Operator action; reachable from any state
    pub async fn disable(&self, provider_id: &str, actor: &str) -> Result<ServiceHealthStatus> {
        self.operator_change(provider_id, actor, true).await
    }

    /// The only way out of `disabled`
    pub async fn enable(&self, provider_id: &str, actor: &str) -> Result<ServiceHealthStatus> {
        self.operator_change(provider_id, actor, false).await
    }

    async fn operator_change(&self, provider_id: &str, actor: &str, disable: bool) -> Result<ServiceHealthStatus> {
        let slot = self.slot(provider_id)?;
        let snapshot = self.config.current();
        let provider = snapshot
            .provider(provider_id)
            .ok_or_else(|| HookGuardError::unconfigured_provider(provider_id))?;

        let (status, mut audits, changed) = {
            let mut health = slot.lock().await;
            let now = self.clock.now();
            let transition = if disable { health.disable(now) } else { health.enable(now) };
            let status = health.status().clone();
            match transition {
                Some(transition) => (status.clone(), self.apply_transition(provider, transition, &status, now), true),
                None => (status, Vec::new(), false),
            }
        };

        if changed {
            info!(provider_id = %provider_id, actor = %actor, disabled = disable, "Provider state changed by operator");
            audits.push(AuditRecord::new(
                if disable { AuditAction::ProviderDisabled } else { AuditAction::ProviderEnabled },
                AuditSeverity::Warning,
                "Provider",
                provider_id,
                json!({ "status": status.status }),
                actor,
            ));
            self.write_snapshot(&status).await;
        }
        for record in audits {
            record_best_effort(&self.audit, record).await;
        }
        Ok(self.with_flags(status))
    }

    /// Side effects of a transition. Runs under the provider's lock; audit
    /// records are returned so they can be written after it is released.
    fn apply_transition(
        &self,
        provider: &ProviderConfig,
        transition: Transition,
        status: &ServiceHealthStatus,
        now: DateTime<Utc>,
    ) -> Vec<AuditRecord> {
        let provider_id = provider.provider_id.as_str();
        let mut audits = Vec::new();

        metrics::counter!(
            "hookguard_health_transitions_total",
            "provider" => provider_id.to_string(),
            "to" => transition.to.to_string()
        )
        .increment(1);
        info!(
            provider_id = %provider_id,
            from = %transition.from,
            to = %transition.to,
            consecutive_failures = status.consecutive_failures,
            consecutive_successes = status.consecutive_successes,
            "Provider health transition"
        );
        self.emit(HealthEvent::Transition {
            provider_id: provider_id.to_string(),
            from: transition.from,
            to: transition.to,
            status: self.with_flags(status.clone()),
        });

        match transition.to {
            HealthState::Degraded | HealthState::Unhealthy => {
                let affected = self.flag_dependents(provider, now);
                let alerting = provider.priority >= self.config.current().health.alert_priority_threshold
                    || (incidents::is_elevated(provider) && transition.to == HealthState::Unhealthy);

                if !alerting {
                    debug!(
                        provider_id = %provider_id,
                        priority = provider.priority,
                        "Below alert priority, no incident raised"
                    );
                    return audits;
                }

                let severity = incidents::severity_for(provider, transition.to);
                let change = self
                    .incidents
                    .lock()
                    .open_or_escalate(provider_id, severity, transition.to, &affected, now);
                match change {
                    Some(IncidentChange::Opened(incident)) => {
                        warn!(
                            provider_id = %provider_id,
                            incident_id = %incident.id,
                            severity = ?incident.severity,
                            "Incident opened"
                        );
                        audits.push(incident_audit(AuditAction::IncidentOpened, &incident));
                        self.emit(HealthEvent::IncidentOpened(incident));
                    }
                    Some(IncidentChange::Escalated(incident)) => {
                        warn!(
                            provider_id = %provider_id,
                            incident_id = %incident.id,
                            severity = ?incident.severity,
                            "Incident escalated"
                        );
                        audits.push(incident_audit(AuditAction::IncidentEscalated, &incident));
                        self.emit(HealthEvent::IncidentEscalated(incident));
                    }
                    _ => {}
                }
            }
            HealthState::Healthy | HealthState::Disabled => {
                self.clear_flags_from(provider_id);
                if let Some(IncidentChange::Closed(incident)) = self.incidents.lock().close(provider_id, now) {
                    info!(provider_id = %provider_id, incident_id = %incident.id, "Incident closed");
                    audits.push(incident_audit(AuditAction::IncidentClosed, &incident));
                    self.emit(HealthEvent::IncidentClosed(incident));
                }
            }
        }

        audits
    }

    fn flag_dependents(&self, provider: &ProviderConfig, now: DateTime<Utc>) -> Vec<String> {
        let snapshot = self.config.current();
        let dependents = cascade_targets(&snapshot, &provider.provider_id);
        if dependents.is_empty() {
            return dependents;
        }

        let risk = provider.dependencies.cascade_risk;
        for dependent in &dependents {
            self.cascade.entry(dependent.clone()).or_default().insert(
                provider.provider_id.clone(),
                CascadeFlag {
                    source_provider: provider.provider_id.clone(),
                    risk,
                    flagged_at: now,
                },
            );
        }

        warn!(
            provider_id = %provider.provider_id,
            risk = ?risk,
            dependents = ?dependents,
            "Dependents flagged at cascade risk"
        );
        self.emit(HealthEvent::CascadeFlagged {
            source_provider: provider.provider_id.clone(),
            risk,
            dependents: dependents.clone(),
        });
        dependents
    }

    fn clear_flags_from(&self, source: &str) {
        let mut cleared = Vec::new();
        for mut entry in self.cascade.iter_mut() {
            if entry.value_mut().remove(source).is_some() {
                cleared.push(entry.key().clone());
            }
        }
        self.cascade.retain(|_, flags| !flags.is_empty());

        if !cleared.is_empty() {
            cleared.sort();
            debug!(provider_id = %source, dependents = ?cleared, "Cascade flags cleared");
            self.emit(HealthEvent::CascadeCleared {
                source_provider: source.to_string(),
                dependents: cleared,
            });
        }
    }

    fn with_flags(&self, mut status: ServiceHealthStatus) -> ServiceHealthStatus {
        status.cascade_flags = self
            .cascade
            .get(&status.provider_id)
            .map(|flags| flags.values().cloned().collect())
            .unwrap_or_default();
        status
    }

    fn emit(&self, event: HealthEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub async fn status(&self, provider_id: &str) -> Result<ServiceHealthStatus> {
        let slot = self.slot(provider_id)?;
        let status = slot.lock().await.status().clone();
        Ok(self.with_flags(status))
    }

    /// Status of every configured provider, in config order
    pub async fn all_statuses(&self) -> Vec<ServiceHealthStatus> {
        let snapshot = self.config.current();
        let mut statuses = Vec::with_capacity(snapshot.providers.len());
        for id in snapshot.provider_ids() {
            if let Ok(status) = self.status(id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    pub fn open_incidents(&self) -> Vec<Incident> {
        self.incidents.lock().open_incidents()
    }

    pub fn closed_incidents(&self) -> Vec<Incident> {
        self.incidents.lock().closed_incidents()
    }

    pub fn open_incident_for(&self, provider_id: &str) -> Option<Incident> {
        self.incidents.lock().open_for(provider_id).cloned()
    }

    async fn write_snapshot(&self, status: &ServiceHealthStatus) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let ttl = Duration::from_secs(self.config.current().health.snapshot_ttl_secs);
        let status = self.with_flags(status.clone());
        match serde_json::to_string(&status) {
            Ok(body) => {
                if let Err(e) = store.set_ex(&snapshot_key(&status.provider_id), &body, ttl).await {
                    warn!(provider_id = %status.provider_id, error = %e, "Failed to cache health snapshot");
                }
            }
            Err(e) => warn!(provider_id = %status.provider_id, error = %e, "Failed to encode health snapshot"),
        }
    }

    /// Refresh every provider's cached snapshot; returns how many were written
    pub async fn cache_snapshots(&self) -> usize {
        if self.snapshots.is_none() {
            return 0;
        }
        let statuses = self.all_statuses().await;
        let count = statuses.len();
        for status in &statuses {
            self.write_snapshot(status).await;
        }
        count
    }

    /// Snapshot as last cached by any instance sharing the store
    pub async fn cached_snapshot(&self, provider_id: &str) -> Option<ServiceHealthStatus> {
        let store = self.snapshots.as_ref()?;
        match store.get(&snapshot_key(provider_id)).await {
            Ok(Some(body)) => serde_json::from_str(&body).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(provider_id = %provider_id, error = %e, "Failed to read health snapshot");
                None
            }
        }
    }
}

fn incident_audit(action: AuditAction, incident: &Incident) -> AuditRecord {
    AuditRecord::new(
        action,
        AuditSeverity::High,
        "Incident",
        &incident.id,
        json!({
            "providerId": incident.provider_id,
            "severity": incident.severity,
            "triggeringStatus": incident.triggering_status,
            "affectedDependents": incident.affected_dependents,
        }),
        ACTOR,
    )
}
