//! Incident book and dependency-graph walk

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use hg_common::{CascadeRisk, HealthState, Incident, IncidentSeverity, ProviderConfig};
use hg_config::GuardConfig;

/// What happened to a provider's incident after a status change
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentChange {
    Opened(Incident),
    Escalated(Incident),
    Closed(Incident),
}

/// Open incidents keyed by provider, plus closed history
#[derive(Debug, Default)]
pub struct IncidentBook {
    open: HashMap<String, Incident>,
    closed: VecDeque<Incident>,
    history_limit: usize,
}

impl IncidentBook {
    pub fn new(history_limit: usize) -> Self {
        Self {
            open: HashMap::new(),
            closed: VecDeque::new(),
            history_limit,
        }
    }

    /// Open an incident, or raise the severity of the one already open
    pub fn open_or_escalate(
        &mut self,
        provider_id: &str,
        severity: IncidentSeverity,
        status: HealthState,
        affected: &[String],
        now: DateTime<Utc>,
    ) -> Option<IncidentChange> {
        if let Some(existing) = self.open.get_mut(provider_id) {
            for dependent in affected {
                if !existing.affected_dependents.contains(dependent) {
                    existing.affected_dependents.push(dependent.clone());
                }
            }
            if severity > existing.severity {
                existing.severity = severity;
                existing.triggering_status = status;
                return Some(IncidentChange::Escalated(existing.clone()));
            }
            return None;
        }

        let mut incident = Incident::open(provider_id, severity, status, now);
        incident.affected_dependents = affected.to_vec();
        self.open.insert(provider_id.to_string(), incident.clone());
        Some(IncidentChange::Opened(incident))
    }

    pub fn close(&mut self, provider_id: &str, now: DateTime<Utc>) -> Option<IncidentChange> {
        let mut incident = self.open.remove(provider_id)?;
        incident.closed_at = Some(now);
        if self.history_limit > 0 {
            if self.closed.len() == self.history_limit {
                self.closed.pop_front();
            }
            self.closed.push_back(incident.clone());
        }
        Some(IncidentChange::Closed(incident))
    }

    pub fn open_for(&self, provider_id: &str) -> Option<&Incident> {
        self.open.get(provider_id)
    }

    pub fn open_incidents(&self) -> Vec<Incident> {
        let mut open: Vec<Incident> = self.open.values().cloned().collect();
        open.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.provider_id.cmp(&b.provider_id)));
        open
    }

    /// Closed incidents, most recent first
    pub fn closed_incidents(&self) -> Vec<Incident> {
        self.closed.iter().rev().cloned().collect()
    }
}

/// Providers at risk when `source` goes down, nearest first.
///
/// Follows both `dependents` edges and reverse `depends_on` edges,
/// transitively, and never includes `source` itself.
pub fn cascade_targets(config: &GuardConfig, source: &str) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::from([source]);
    let mut queue: VecDeque<&str> = VecDeque::from([source]);
    let mut ordered = Vec::new();

    while let Some(current) = queue.pop_front() {
        for next in direct_dependents(config, current) {
            if visited.insert(next) {
                ordered.push(next.to_string());
                queue.push_back(next);
            }
        }
    }
    ordered
}

fn direct_dependents<'a>(config: &'a GuardConfig, provider_id: &str) -> Vec<&'a str> {
    let declared = config
        .provider(provider_id)
        .map(|p| p.dependencies.dependents.iter().map(String::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    let reverse = config
        .providers
        .iter()
        .filter(|p| p.dependencies.depends_on.iter().any(|d| d == provider_id))
        .map(|p| p.provider_id.as_str());

    let mut all = declared;
    for id in reverse {
        if !all.contains(&id) {
            all.push(id);
        }
    }
    all
}

/// Critical-path providers with high cascade risk raise incidents above the
/// priority filter and at elevated severity
pub fn is_elevated(provider: &ProviderConfig) -> bool {
    provider.dependencies.critical_path && provider.dependencies.cascade_risk == CascadeRisk::High
}

pub fn severity_for(provider: &ProviderConfig, status: HealthState) -> IncidentSeverity {
    match status {
        HealthState::Unhealthy if is_elevated(provider) => IncidentSeverity::Critical,
        HealthState::Unhealthy => IncidentSeverity::Major,
        _ => IncidentSeverity::Warning,
    }
}
