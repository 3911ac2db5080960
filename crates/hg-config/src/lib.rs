//! HookGuard Configuration
//!
//! Loads the provider set and component tunables from TOML, applies
//! environment overrides for secrets, validates the result and keeps it in a
//! [`ConfigStore`] that swaps whole snapshots on hot reload.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hg_common::ProviderConfig;

mod settings;
mod store;

pub use settings::{BroadcastSettings, CoordinatorSettings, HealthSettings, ServerSettings, StoreSettings};
pub use store::ConfigStore;

const SECRET_ENV_PREFIX: &str = "HOOKGUARD_SECRET_";
const REDIS_URL_ENV: &str = "HOOKGUARD_REDIS_URL";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Complete configuration snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub broadcast: BroadcastSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl GuardConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: GuardConfig = toml::from_str(raw)?;
        Ok(config)
    }

    /// Read, apply process environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.retain(|p| p.provider_id != provider.provider_id);
        self.providers.push(provider);
        self
    }

    pub fn provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.provider_id == provider_id)
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.provider_id.as_str())
    }

    /// Secrets from `HOOKGUARD_SECRET_<PROVIDER>` (comma-separated for rotation)
    /// replace the file values; `HOOKGUARD_REDIS_URL` replaces the store URL.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for provider in &mut self.providers {
            let key = secret_env_key(&provider.provider_id);
            if let Some(value) = lookup(&key) {
                let secrets: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                if !secrets.is_empty() {
                    tracing::debug!(provider_id = %provider.provider_id, count = secrets.len(), "Secrets loaded from environment");
                    provider.secrets = secrets;
                }
            }
        }

        if let Some(url) = lookup(REDIS_URL_ENV) {
            self.store.redis_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for provider in &self.providers {
            let id = provider.provider_id.as_str();

            if !provider_id_pattern().is_match(id) {
                return Err(ConfigError::invalid(format!(
                    "provider id '{}' must match [a-z0-9_-]+",
                    id
                )));
            }
            if !seen.insert(id) {
                return Err(ConfigError::invalid(format!("duplicate provider '{}'", id)));
            }
            if provider.secrets.iter().all(|s| s.is_empty()) {
                return Err(ConfigError::invalid(format!("provider '{}' has no signing secret", id)));
            }
            if !(1..=10).contains(&provider.priority) {
                return Err(ConfigError::invalid(format!(
                    "provider '{}' priority {} outside 1..=10",
                    id, provider.priority
                )));
            }
            if provider.timestamp_tolerance_secs == Some(0) {
                return Err(ConfigError::invalid(format!("provider '{}' tolerance must be positive", id)));
            }
            if let Some(limit) = provider.rate_limit {
                if limit.window_secs == 0 || limit.max_requests == 0 {
                    return Err(ConfigError::invalid(format!(
                        "provider '{}' rate limit needs a non-zero window and budget",
                        id
                    )));
                }
            }
        }

        for provider in &self.providers {
            let edges = &provider.dependencies;
            for other in edges.depends_on.iter().chain(edges.dependents.iter()) {
                if !seen.contains(other.as_str()) {
                    return Err(ConfigError::invalid(format!(
                        "provider '{}' references unknown provider '{}'",
                        provider.provider_id, other
                    )));
                }
            }
        }

        if self.coordinator.max_attempts == 0 {
            return Err(ConfigError::invalid("coordinator.max_attempts must be at least 1"));
        }
        if self.coordinator.critical_concurrency == 0 || self.coordinator.standard_concurrency == 0 {
            return Err(ConfigError::invalid("coordinator pool concurrency must be at least 1"));
        }
        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(ConfigError::invalid("health thresholds must be at least 1"));
        }
        if self.health.recovery_threshold > self.health.success_threshold {
            return Err(ConfigError::invalid(
                "health.recovery_threshold cannot exceed health.success_threshold",
            ));
        }
        if self.broadcast.replay_buffer_size == 0 {
            return Err(ConfigError::invalid("broadcast.replay_buffer_size must be at least 1"));
        }

        Ok(())
    }
}

fn provider_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_-]+$").expect("static regex"))
}

fn secret_env_key(provider_id: &str) -> String {
    format!(
        "{}{}",
        SECRET_ENV_PREFIX,
        provider_id.to_ascii_uppercase().replace('-', "_")
    )
}
