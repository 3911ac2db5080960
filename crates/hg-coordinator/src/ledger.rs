//! Append-only processing trail per event
//!
//! Every attempt appends one [`ProcessingOutcome`]. The latest outcome is
//! mirrored into the shared store so another process can answer a duplicate
//! delivery without re-running the handler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, warn};

use hg_common::ProcessingOutcome;
use hg_store::SharedStore;

pub fn outcome_key(provider_id: &str, event_id: &str) -> String {
    format!("outcome:{}:{}", provider_id, event_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Recorded,
    /// A second success for an event that already succeeded
    RejectedDuplicateSuccess,
}

pub struct OutcomeLedger {
    entries: DashMap<String, Vec<ProcessingOutcome>>,
    store: SharedStore,
    ttl: Duration,
}

impl OutcomeLedger {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            ttl,
        }
    }

    /// Append locally, then mirror to the shared store.
    ///
    /// The local append is the durable step; a store failure only costs
    /// cross-process duplicate answers and is logged.
    pub async fn append(&self, outcome: ProcessingOutcome) -> AppendResult {
        let key = outcome_key(&outcome.provider_id, &outcome.event_id);
        {
            let mut trail = self.entries.entry(key.clone()).or_default();
            if outcome.success && trail.iter().any(|o| o.success) {
                error!(
                    provider_id = %outcome.provider_id,
                    event_id = %outcome.event_id,
                    "Refusing second success outcome for event"
                );
                return AppendResult::RejectedDuplicateSuccess;
            }
            trail.push(outcome.clone());
        }

        match serde_json::to_string(&outcome) {
            Ok(json) => {
                if let Err(e) = self.store.set_ex(&key, &json, self.ttl).await {
                    warn!(key = %key, error = %e, "Failed to mirror outcome to shared store");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to serialize outcome"),
        }
        AppendResult::Recorded
    }

    pub fn history(&self, provider_id: &str, event_id: &str) -> Vec<ProcessingOutcome> {
        self.entries
            .get(&outcome_key(provider_id, event_id))
            .map(|trail| trail.clone())
            .unwrap_or_default()
    }

    /// Latest outcome, from this process or from the shared store
    pub async fn latest(&self, provider_id: &str, event_id: &str) -> Option<ProcessingOutcome> {
        let key = outcome_key(provider_id, event_id);
        if let Some(last) = self.entries.get(&key).and_then(|trail| trail.last().cloned()) {
            return Some(last);
        }

        match self.store.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring unreadable stored outcome");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Outcome lookup failed, treating event as new");
                None
            }
        }
    }

    /// Re-mirror the latest local outcome when the shared store lost it.
    /// Returns `true` when a write was needed.
    pub async fn reconcile(&self, provider_id: &str, event_id: &str) -> bool {
        let key = outcome_key(provider_id, event_id);
        let Some(latest) = self.entries.get(&key).and_then(|trail| trail.last().cloned()) else {
            return false;
        };

        match self.store.exists(&key).await {
            Ok(true) => false,
            Ok(false) => {
                let Ok(json) = serde_json::to_string(&latest) else {
                    return false;
                };
                match self.store.set_ex(&key, &json, self.ttl).await {
                    Ok(()) => {
                        debug!(key = %key, "Outcome re-mirrored to shared store");
                        true
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Outcome reconciliation failed");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Outcome reconciliation skipped, store unavailable");
                false
            }
        }
    }

    pub fn success_count(&self, provider_id: &str, event_id: &str) -> usize {
        self.history(provider_id, event_id).iter().filter(|o| o.success).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop local trails whose latest entry is older than `cutoff`
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, trail| trail.last().map(|o| o.recorded_at >= cutoff).unwrap_or(false));
        before - self.entries.len()
    }
}
