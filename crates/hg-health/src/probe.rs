//! Health probes
//!
//! A probe only says whether the provider answered acceptably. Timing,
//! the hard timeout and panic containment are handled by [`run_probe`], so a
//! misbehaving probe always turns into a failure observation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::state::Observation;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// GET against a provider status URL; 5xx and transport errors are failures
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(format!("status {}", status.as_u16()));
        }
        debug!(url = %self.url, status = status.as_u16(), "Probe answered");
        Ok(())
    }
}

/// Run a probe on its own task under a hard timeout
pub async fn run_probe(probe: Arc<dyn HealthProbe>, timeout: Duration) -> Observation {
    let started = Instant::now();
    let task = tokio::spawn(async move { probe.check().await });
    let abort = task.abort_handle();

    let result = tokio::time::timeout(timeout, task).await;
    let latency = started.elapsed();

    match result {
        Ok(Ok(Ok(()))) => Observation::success(latency),
        Ok(Ok(Err(reason))) => Observation::failure(latency, reason),
        Ok(Err(join_error)) => Observation::failure(latency, format!("probe panicked: {}", join_error)),
        Err(_) => {
            abort.abort();
            Observation::failure(latency, format!("probe timed out after {}ms", timeout.as_millis()))
        }
    }
}
