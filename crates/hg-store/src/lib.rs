//! HookGuard shared key-value store
//!
//! Every piece of state that must hold across processes (replay markers,
//! rate windows, outcome records, health snapshots) goes through [`KvStore`].
//! Check-and-set and increment operations are atomic at the backend, so no
//! in-process lock is relied on for correctness.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use hg_common::SharedClock;
use hg_config::StoreSettings;

mod memory;
mod redis_store;
mod testing;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use testing::FaultInjectingStore;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// GET / SETEX / EXISTS / INCR / EXPIRE with atomic semantics
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set only when the key is absent. `true` means this call created it.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn incr(&self, key: &str) -> Result<u64>;

    /// Increment, attaching `ttl` in the same atomic step when the key is created
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    fn backend(&self) -> &'static str;

    /// Reclaim expired keys held in process. Backends with native expiry return 0.
    fn sweep_expired(&self) -> usize {
        0
    }
}

pub type SharedStore = Arc<dyn KvStore>;

/// Build the configured backend: Redis when a URL is set, otherwise in-process
pub async fn connect(settings: &StoreSettings, clock: SharedClock) -> Result<SharedStore> {
    match settings.redis_url.as_deref() {
        Some(url) => {
            info!(backend = "redis", "Connecting shared store");
            let store = RedisStore::connect(url, settings.key_prefix.clone()).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!(backend = "memory", "Using in-process store (single instance only)");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
    }
}

pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
