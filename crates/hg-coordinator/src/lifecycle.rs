//! Lifecycle Manager - Background tasks around the coordinator
//!
//! Handles:
//! - Health probes, one timer task per provider with a `probe_url`
//! - Broadcast hub heartbeat and stale-connection flagging
//! - Fan-out of health events into the `api_status_updates` room
//! - Health snapshot refresh in the shared store
//! - Configuration hot reload
//! - Store expiry sweep and outcome ledger pruning
//!
//! Every task stops on one shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use hg_broadcast::{BroadcastMessage, MessagePriority, RealtimeBroadcastHub, ROOM_API_STATUS};
use hg_common::audit::record_best_effort;
use hg_common::{AuditAction, AuditRecord, AuditSeverity, AuditSink, HealthState};
use hg_health::{HealthEvent, HttpProbe};
use hg_store::SharedStore;

use crate::coordinator::WebhookCoordinator;

const ACTOR: &str = "lifecycle";

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How often the config file's modification time is checked
    pub config_poll_interval: Duration,
    /// Store expiry sweep and ledger pruning
    pub maintenance_interval: Duration,
    /// Health snapshot rewrite into the shared store
    pub snapshot_refresh_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            config_poll_interval: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(60),
            snapshot_refresh_interval: Duration::from_secs(120),
        }
    }
}

/// Manages lifecycle tasks for the coordinator
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    probing: Arc<DashSet<String>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(
        coordinator: Arc<WebhookCoordinator>,
        store: SharedStore,
        audit: Arc<dyn AuditSink>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let probing = Arc::new(DashSet::new());
        let http = reqwest::Client::builder().build().unwrap_or_default();

        spawn_missing_probes(&coordinator, &http, &probing, &shutdown_tx);

        // Hub heartbeat
        {
            let hub = coordinator.hub().clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = Duration::from_secs(hub.settings().heartbeat_interval_secs.max(1));

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let stale = hub.heartbeat();
                            if !stale.is_empty() {
                                debug!(count = stale.len(), "Stale observer connections flagged");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Hub heartbeat shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Health events into the status room
        {
            let hub = coordinator.hub().clone();
            let mut events = coordinator.health().subscribe();
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = events.recv() => match received {
                            Ok(event) => {
                                hub.broadcast(health_message(&hub, &event));
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped = skipped, "Health event bridge lagged, events dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("Health event channel closed");
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => {
                            info!("Health event bridge shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Health snapshot refresh
        {
            let health = coordinator.health().clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.snapshot_refresh_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let written = health.cache_snapshots().await;
                            debug!(written = written, "Health snapshots refreshed");
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Snapshot refresher shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Configuration hot reload
        {
            let coordinator = coordinator.clone();
            let audit = audit.clone();
            let http = http.clone();
            let probing = probing.clone();
            let shutdown_tx_for_probes = shutdown_tx.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.config_poll_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match coordinator.config().reload_if_changed() {
                                Ok(true) => {
                                    let generation = coordinator.config().generation();
                                    info!(generation = generation, "Configuration reloaded");
                                    record_best_effort(
                                        &audit,
                                        AuditRecord::new(
                                            AuditAction::ConfigReloaded,
                                            AuditSeverity::Info,
                                            "Configuration",
                                            generation.to_string(),
                                            json!({
                                                "providers": coordinator.config().current().providers.len(),
                                            }),
                                            ACTOR,
                                        ),
                                    )
                                    .await;
                                    spawn_missing_probes(&coordinator, &http, &probing, &shutdown_tx_for_probes);
                                }
                                Ok(false) => {}
                                Err(e) => error!(error = %e, "Configuration reload rejected"),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Config watcher shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Store sweep and ledger pruning
        {
            let coordinator = coordinator.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.maintenance_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let swept = store.sweep_expired();
                            let ttl = coordinator.config().current().coordinator.outcome_ttl();
                            let cutoff = chrono::Duration::from_std(ttl)
                                .ok()
                                .map(|ttl| coordinator.clock().now() - ttl);
                            let pruned = cutoff.map(|c| coordinator.ledger().prune_before(c)).unwrap_or(0);
                            debug!(swept = swept, pruned = pruned, "Maintenance pass complete");
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Maintenance task shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("Lifecycle tasks started");
        Self { shutdown_tx, probing }
    }

    /// Providers with a running probe task
    pub fn probing(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.probing.iter().map(|id| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Signal all lifecycle tasks to stop
    pub fn shutdown(&self) {
        info!("Shutting down lifecycle tasks");
        let _ = self.shutdown_tx.send(());
    }
}

/// One probe task per provider that has a `probe_url` and none running yet.
/// A task exits on its own once its provider loses the URL or disappears.
fn spawn_missing_probes(
    coordinator: &Arc<WebhookCoordinator>,
    http: &reqwest::Client,
    probing: &Arc<DashSet<String>>,
    shutdown_tx: &broadcast::Sender<()>,
) {
    let snapshot = coordinator.config().current();

    for provider in snapshot.providers.iter().filter(|p| p.probe_url.is_some()) {
        if !probing.insert(provider.provider_id.clone()) {
            continue;
        }

        let provider_id = provider.provider_id.clone();
        let coordinator = coordinator.clone();
        let http = http.clone();
        let probing = probing.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let interval = snapshot.health.probe_interval();

        info!(provider_id = %provider_id, interval_secs = interval.as_secs(), "Starting health probe");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = coordinator.config().current();
                        let Some(url) = current.provider(&provider_id).and_then(|p| p.probe_url.clone()) else {
                            info!(provider_id = %provider_id, "Provider no longer probed");
                            break;
                        };
                        let probe = Arc::new(HttpProbe::new(http.clone(), url));
                        match coordinator.health().probe(&provider_id, probe).await {
                            Ok(status) => debug!(provider_id = %provider_id, status = %status.status, "Probe recorded"),
                            Err(e) => warn!(provider_id = %provider_id, error = %e, "Probe not recorded"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(provider_id = %provider_id, "Health probe shutting down");
                        break;
                    }
                }
            }
            probing.remove(&provider_id);
        });
    }
}

/// Status-room message for a health event. Incident openings are critical,
/// so observers must acknowledge them.
pub fn health_message(hub: &RealtimeBroadcastHub, event: &HealthEvent) -> BroadcastMessage {
    let (message_type, priority) = match event {
        HealthEvent::Transition { to: HealthState::Unhealthy, .. } => ("health_transition", MessagePriority::High),
        HealthEvent::Transition { .. } => ("health_transition", MessagePriority::Normal),
        HealthEvent::IncidentOpened(_) => ("incident_opened", MessagePriority::Critical),
        HealthEvent::IncidentEscalated(_) => ("incident_escalated", MessagePriority::Critical),
        HealthEvent::IncidentClosed(_) => ("incident_closed", MessagePriority::High),
        HealthEvent::CascadeFlagged { .. } => ("cascade_flagged", MessagePriority::High),
        HealthEvent::CascadeCleared { .. } => ("cascade_cleared", MessagePriority::Normal),
    };
    let payload = serde_json::to_value(event).unwrap_or_else(|e| json!({ "error": e.to_string() }));
    hub.message(ROOM_API_STATUS, message_type, payload, priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hg_common::{HealthState, Incident, IncidentSeverity, ManualClock};
    use hg_config::BroadcastSettings;

    #[test]
    fn test_lifecycle_config_default() {
        let config = LifecycleConfig::default();
        assert_eq!(config.config_poll_interval, Duration::from_secs(10));
        assert_eq!(config.maintenance_interval, Duration::from_secs(60));
        assert_eq!(config.snapshot_refresh_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_incident_messages_are_critical() {
        let hub = RealtimeBroadcastHub::new(BroadcastSettings::default(), Arc::new(ManualClock::at_unix(1_700_000_000)));
        let incident = Incident::open(
            "payments",
            IncidentSeverity::Critical,
            HealthState::Unhealthy,
            chrono::Utc::now(),
        );

        let opened = health_message(&hub, &HealthEvent::IncidentOpened(incident));
        assert_eq!(opened.room, ROOM_API_STATUS);
        assert_eq!(opened.message_type, "incident_opened");
        assert!(opened.is_critical());
        assert_eq!(opened.payload["type"], "incident_opened");
        assert_eq!(opened.payload["providerId"], "payments");

        let cleared = health_message(
            &hub,
            &HealthEvent::CascadeCleared {
                source_provider: "payments".to_string(),
                dependents: vec!["billing".to_string()],
            },
        );
        assert_eq!(cleared.priority, MessagePriority::Normal);
        assert_eq!(cleared.payload["dependents"][0], "billing");
    }
}
