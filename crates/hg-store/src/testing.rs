//! Store wrapper that can be switched into an outage, for exercising fail-open paths

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::{KvStore, MemoryStore, Result, StoreError};

pub struct FaultInjectingStore {
    inner: MemoryStore,
    available: AtomicBool,
}

impl FaultInjectingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("injected outage".to_string()))
        }
    }
}

#[async_trait]
impl KvStore for FaultInjectingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.check()?;
        self.inner.incr_with_expiry(key, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    fn backend(&self) -> &'static str {
        "fault-injecting"
    }
}
