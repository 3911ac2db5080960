//! Tunables for each component, deserialized from their TOML sections

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `[coordinator]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Total processing attempts, including the first one
    pub max_attempts: u32,
    pub critical_concurrency: u32,
    pub standard_concurrency: u32,
    pub standard_rate_limit_per_minute: Option<u32>,
    pub handler_timeout_ms: u64,
    pub shutdown_drain_timeout_secs: u64,
    pub max_json_depth: usize,
    /// How long the latest outcome per event stays in the shared store
    pub outcome_ttl_secs: u64,
    /// Lifetime of the cross-instance processing claim when its holder dies
    /// without releasing it
    pub claim_ttl_secs: u64,
    /// Business service that receives verified events; unset logs them instead
    pub downstream_url: Option<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            max_attempts: 3,
            critical_concurrency: 8,
            standard_concurrency: 16,
            standard_rate_limit_per_minute: None,
            handler_timeout_ms: 10_000,
            shutdown_drain_timeout_secs: 30,
            max_json_depth: 32,
            outcome_ttl_secs: 86_400,
            claim_ttl_secs: 900,
            downstream_url: None,
        }
    }
}

impl CoordinatorSettings {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_timeout_secs)
    }

    pub fn outcome_ttl(&self) -> Duration {
        Duration::from_secs(self.outcome_ttl_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs.max(1))
    }
}

/// `[health]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Consecutive failures that move `degraded` to `unhealthy`
    pub failure_threshold: u32,
    /// Consecutive successes that move `unhealthy` to `degraded`
    pub recovery_threshold: u32,
    /// Consecutive successes that move `degraded` to `healthy`
    pub success_threshold: u32,
    /// Providers below this priority degrade into metrics only
    pub alert_priority_threshold: u8,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub rolling_window: usize,
    pub snapshot_ttl_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            success_threshold: 3,
            alert_priority_threshold: 7,
            probe_interval_secs: 30,
            probe_timeout_ms: 5000,
            rolling_window: 100,
            snapshot_ttl_secs: 300,
        }
    }
}

impl HealthSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// `[broadcast]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub replay_buffer_size: usize,
    pub default_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub connection_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            replay_buffer_size: 50,
            default_ttl_secs: 300,
            heartbeat_interval_secs: 30,
            stale_after_secs: 90,
            connection_capacity: 256,
        }
    }
}

/// `[store]` section. No `redis_url` means the in-process store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "hookguard".to_string(),
        }
    }
}

/// `[server]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Reverse proxies whose `X-Forwarded-For` is believed. Requests from any
    /// other peer are keyed by the peer address.
    pub trusted_proxies: Vec<IpAddr>,
}

impl ServerSettings {
    pub fn is_trusted_proxy(&self, addr: &IpAddr) -> bool {
        self.trusted_proxies.contains(addr)
    }
}
