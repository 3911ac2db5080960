//! Shared coordinator harness: in-memory store, manual clock, scripted handler

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use hg_broadcast::RealtimeBroadcastHub;
use hg_common::{InboundRequest, ManualClock, MemoryAuditSink, ProviderConfig, SignatureScheme};
use hg_config::{BroadcastSettings, ConfigStore, CoordinatorSettings, GuardConfig};
use hg_coordinator::{Collaborators, EventHandler, HandlerError, WebhookCoordinator};
use hg_guard::ReplayAndRateGuard;
use hg_health::ServiceHealthRegistry;
use hg_store::{FaultInjectingStore, MemoryStore};
use hg_verify::{HmacSha256Hex, SchemeVerifier, SignatureVerifier, SigningInput};

/// Aligned to a 60s window boundary
pub const T0: i64 = 1_700_000_040;
pub const SECRET: &str = "k";

/// Answers from a script, then succeeds; counts every call
#[derive(Default)]
pub struct SpyHandler {
    calls: AtomicU32,
    script: Mutex<VecDeque<Result<(), HandlerError>>>,
    delay: Mutex<Option<Duration>>,
    panic_on_call: Mutex<bool>,
}

impl SpyHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(answers: Vec<Result<(), HandlerError>>) -> Arc<Self> {
        let spy = Self::default();
        *spy.script.lock() = answers.into();
        Arc::new(spy)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        let spy = Self::default();
        *spy.delay.lock() = Some(delay);
        Arc::new(spy)
    }

    /// Scripted answers, each after `delay`
    pub fn scripted_slow(answers: Vec<Result<(), HandlerError>>, delay: Duration) -> Arc<Self> {
        let spy = Self::default();
        *spy.script.lock() = answers.into();
        *spy.delay.lock() = Some(delay);
        Arc::new(spy)
    }

    pub fn panicking() -> Arc<Self> {
        let spy = Self::default();
        *spy.panic_on_call.lock() = true;
        Arc::new(spy)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for SpyHandler {
    async fn handle_verified_event(&self, _provider_id: &str, _event_id: &str, _payload: &Value) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.panic_on_call.lock() {
            panic!("handler bug");
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self.script.lock().pop_front();
        answer.unwrap_or(Ok(()))
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<FaultInjectingStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub config: Arc<ConfigStore>,
    pub health: Arc<ServiceHealthRegistry>,
    pub hub: Arc<RealtimeBroadcastHub>,
    pub handler: Arc<SpyHandler>,
    pub coordinator: Arc<WebhookCoordinator>,
}

pub fn provider(id: &str) -> ProviderConfig {
    ProviderConfig::new(id, SignatureScheme::HmacSha256Hex, SECRET)
}

pub fn fast_retries() -> CoordinatorSettings {
    CoordinatorSettings {
        retry_base_delay_ms: 1000,
        retry_max_delay_ms: 4000,
        max_attempts: 3,
        handler_timeout_ms: 2000,
        shutdown_drain_timeout_secs: 5,
        ..CoordinatorSettings::default()
    }
}

pub fn harness(providers: Vec<ProviderConfig>, settings: CoordinatorSettings, handler: Arc<SpyHandler>) -> Harness {
    let clock = Arc::new(ManualClock::at_unix(T0));
    let mut guard_config = GuardConfig {
        coordinator: settings,
        ..GuardConfig::default()
    };
    for p in providers {
        guard_config = guard_config.with_provider(p);
    }
    let config = Arc::new(ConfigStore::new(guard_config).unwrap());
    let store = Arc::new(FaultInjectingStore::new(MemoryStore::new(clock.clone())));
    let audit = Arc::new(MemoryAuditSink::new());
    let health = Arc::new(ServiceHealthRegistry::new(config.clone(), audit.clone(), clock.clone()));
    let hub = Arc::new(RealtimeBroadcastHub::new(BroadcastSettings::default(), clock.clone()));

    let coordinator = WebhookCoordinator::new(Collaborators {
        config: config.clone(),
        verifier: Arc::new(SignatureVerifier::new(config.clone(), clock.clone())),
        guard: Arc::new(ReplayAndRateGuard::new(store.clone(), audit.clone(), clock.clone())),
        health: health.clone(),
        hub: hub.clone(),
        handler: handler.clone(),
        audit: audit.clone(),
        store: store.clone(),
        clock: clock.clone(),
    });

    Harness {
        clock,
        store,
        audit,
        config,
        health,
        hub,
        handler,
        coordinator,
    }
}

impl Harness {
    /// A second coordinator instance over the same store, config and handler
    pub fn sibling(&self) -> Arc<WebhookCoordinator> {
        WebhookCoordinator::new(Collaborators {
            config: self.config.clone(),
            verifier: Arc::new(SignatureVerifier::new(self.config.clone(), self.clock.clone())),
            guard: Arc::new(ReplayAndRateGuard::new(self.store.clone(), self.audit.clone(), self.clock.clone())),
            health: self.health.clone(),
            hub: self.hub.clone(),
            handler: self.handler.clone(),
            audit: self.audit.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
        })
    }
}

pub fn signed(provider_id: &str, body: &str) -> InboundRequest {
    let signature = HmacSha256Hex
        .sign(&SigningInput::payload(body.as_bytes()), SECRET.as_bytes())
        .unwrap();
    InboundRequest::new(provider_id, body.to_string())
        .with_header("x-signature", signature)
        .with_source("10.0.0.1")
}

/// Poll until `condition` holds; works with real and paused time
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
