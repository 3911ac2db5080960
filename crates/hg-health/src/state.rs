//! Per-provider health state machine
//!
//! One observation moves a provider at most one step. Failures walk
//! `healthy -> degraded -> unhealthy`; a run of successes walks back
//! `unhealthy -> degraded -> healthy`. `disabled` ignores observations.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use hg_common::{HealthState, ServiceHealthStatus};
use hg_config::HealthSettings;

/// Result of a probe or an outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl Observation {
    pub fn success(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
            error: None,
        }
    }

    pub fn failure(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub failure: u32,
    pub recovery: u32,
    pub success: u32,
    pub warning_latency: Duration,
}

impl Thresholds {
    pub fn from_settings(settings: &HealthSettings, warning_latency_ms: u64) -> Self {
        Self {
            failure: settings.failure_threshold,
            recovery: settings.recovery_threshold,
            success: settings.success_threshold,
            warning_latency: Duration::from_millis(warning_latency_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: f64,
}

#[derive(Debug)]
pub struct ProviderHealth {
    status: ServiceHealthStatus,
    window: VecDeque<Sample>,
    window_size: usize,
}

impl ProviderHealth {
    pub fn new(provider_id: &str, window_size: usize, now: DateTime<Utc>) -> Self {
        Self {
            status: ServiceHealthStatus::new(provider_id, now),
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    pub fn status(&self) -> &ServiceHealthStatus {
        &self.status
    }

    pub fn state(&self) -> HealthState {
        self.status.status
    }

    pub fn observe(&mut self, observation: &Observation, thresholds: &Thresholds, now: DateTime<Utc>) -> Option<Transition> {
        if self.status.status == HealthState::Disabled {
            return None;
        }

        self.status.last_checked_at = Some(now);
        self.push_sample(observation);

        let slow = observation.latency > thresholds.warning_latency;
        let from = self.status.status;

        let to = if observation.success && !slow {
            self.status.consecutive_failures = 0;
            self.status.consecutive_successes += 1;
            let run = self.status.consecutive_successes;
            match from {
                HealthState::Unhealthy if run >= thresholds.recovery => HealthState::Degraded,
                HealthState::Degraded if run >= thresholds.success => HealthState::Healthy,
                other => other,
            }
        } else if observation.success {
            // Slow but answered: a warning, not a failure
            self.status.consecutive_failures = 0;
            self.status.consecutive_successes = 0;
            match from {
                HealthState::Healthy => HealthState::Degraded,
                other => other,
            }
        } else {
            self.status.consecutive_successes = 0;
            self.status.consecutive_failures += 1;
            match from {
                HealthState::Healthy => HealthState::Degraded,
                HealthState::Degraded if self.status.consecutive_failures >= thresholds.failure => {
                    HealthState::Unhealthy
                }
                other => other,
            }
        };

        self.transition_to(to, now)
    }

    pub fn disable(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.transition_to(HealthState::Disabled, now)
    }

    /// Leave `disabled` with a clean slate
    pub fn enable(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.status.status != HealthState::Disabled {
            return None;
        }
        self.status.consecutive_failures = 0;
        self.status.consecutive_successes = 0;
        self.window.clear();
        self.recompute();
        self.transition_to(HealthState::Healthy, now)
    }

    fn transition_to(&mut self, to: HealthState, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.status.status;
        if from == to {
            return None;
        }
        self.status.status = to;
        self.status.last_transition_at = now;
        Some(Transition { from, to })
    }

    fn push_sample(&mut self, observation: &Observation) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            success: observation.success,
            latency_ms: observation.latency.as_secs_f64() * 1000.0,
        });
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.window.is_empty() {
            self.status.rolling_avg_latency_ms = 0.0;
            self.status.error_rate_pct = 0.0;
            return;
        }
        let n = self.window.len() as f64;
        let total_latency: f64 = self.window.iter().map(|s| s.latency_ms).sum();
        let failures = self.window.iter().filter(|s| !s.success).count() as f64;
        self.status.rolling_avg_latency_ms = total_latency / n;
        self.status.error_rate_pct = failures / n * 100.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            failure: 3,
            recovery: 2,
            success: 3,
            warning_latency: Duration::from_millis(500),
        }
    }

    fn fast_ok() -> Observation {
        Observation::success(Duration::from_millis(20))
    }

    fn fail() -> Observation {
        Observation::failure(Duration::from_millis(20), "503")
    }

    fn walk(health: &mut ProviderHealth, observations: &[Observation]) -> Vec<HealthState> {
        observations
            .iter()
            .map(|o| {
                health.observe(o, &thresholds(), Utc::now());
                health.state()
            })
            .collect()
    }

    #[test]
    fn test_three_failures_pass_through_degraded() {
        let mut health = ProviderHealth::new("p", 10, Utc::now());
        let states = walk(&mut health, &[fail(), fail(), fail()]);
        assert_eq!(
            states,
            vec![HealthState::Degraded, HealthState::Degraded, HealthState::Unhealthy]
        );
        assert_eq!(health.status().consecutive_failures, 3);
    }

    #[test]
    fn test_three_successes_restore_from_unhealthy() {
        let mut health = ProviderHealth::new("p", 10, Utc::now());
        walk(&mut health, &[fail(), fail(), fail()]);

        let states = walk(&mut health, &[fast_ok(), fast_ok(), fast_ok()]);
        assert_eq!(
            states,
            vec![HealthState::Unhealthy, HealthState::Degraded, HealthState::Healthy]
        );
    }

    #[test]
    fn test_single_success_never_restores_healthy() {
        let mut health = ProviderHealth::new("p", 10, Utc::now());
        walk(&mut health, &[fail(), fail(), fail()]);
        let states = walk(&mut health, &[fast_ok(), fail(), fast_ok()]);
        assert_eq!(states, vec![HealthState::Unhealthy; 3]);
    }

    #[test]
    fn test_failure_interrupts_recovery_run() {
        let mut health = ProviderHealth::new("p", 10, Utc::now());
        walk(&mut health, &[fail()]);
        let states = walk(&mut health, &[fast_ok(), fast_ok(), fail(), fast_ok(), fast_ok(), fast_ok()]);
        assert_eq!(states.last(), Some(&HealthState::Healthy));
        assert_eq!(states[2], HealthState::Degraded);
        assert_eq!(states[4], HealthState::Degraded);
    }

    #[test]
    fn test_slow_success_degrades_but_does_not_fail() {
        let mut health = ProviderHealth::new("p", 10, Utc::now());
        let slow = Observation::success(Duration::from_millis(900));
        let states = walk(&mut health, &[slow.clone(), slow.clone(), slow]);
        assert_eq!(states, vec![HealthState::Degraded; 3]);
        assert_eq!(health.status().consecutive_failures, 0);
    }

    #[test]
    fn test_disabled_ignores_observations_until_enabled() {
        let mut health = ProviderHealth::new("p", 10, Utc::now());
        let t = health.disable(Utc::now()).unwrap();
        assert_eq!(t.from, HealthState::Healthy);
        assert!(walk(&mut health, &[fail(), fail(), fail()]).iter().all(|s| *s == HealthState::Disabled));
        assert!(health.status().last_checked_at.is_none());

        let t = health.enable(Utc::now()).unwrap();
        assert_eq!(t.to, HealthState::Healthy);
        assert!(health.enable(Utc::now()).is_none());
    }

    #[test]
    fn test_rolling_window_metrics() {
        let mut health = ProviderHealth::new("p", 4, Utc::now());
        walk(
            &mut health,
            &[
                Observation::success(Duration::from_millis(100)),
                Observation::failure(Duration::from_millis(300), "reset"),
                Observation::success(Duration::from_millis(100)),
                Observation::success(Duration::from_millis(100)),
            ],
        );
        assert!((health.status().rolling_avg_latency_ms - 150.0).abs() < 1e-6);
        assert!((health.status().error_rate_pct - 25.0).abs() < 1e-6);

        // Oldest sample is evicted
        walk(&mut health, &[Observation::success(Duration::from_millis(100))]);
        assert!((health.status().rolling_avg_latency_ms - 150.0).abs() < 1e-6);
        walk(&mut health, &[Observation::success(Duration::from_millis(100))]);
        assert!((health.status().error_rate_pct - 0.0).abs() < 1e-6);
    }
}
