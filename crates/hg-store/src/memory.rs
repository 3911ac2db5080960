//! In-process store backed by a sharded map
//!
//! Atomicity comes from the per-shard entry lock, which is enough for a
//! single process. Multi-instance deployments must use Redis.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use hg_common::SharedClock;

use crate::{KvStore, Result, StoreError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl).ok().map(|d| self.clock.now() + d)
    }

    /// Drop expired keys; the lifecycle sweeper calls this periodically
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let fresh = StoredValue {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_live(now) {
                    Ok(false)
                } else {
                    existing.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| StoredValue {
            value: "0".to_string(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = StoredValue {
                value: "0".to_string(),
                expires_at: None,
            };
        }
        let next = entry
            .value
            .parse::<u64>()
            .map_err(|_| StoreError::Protocol(format!("value at {} is not an integer", key)))?
            + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| StoredValue {
            value: "0".to_string(),
            expires_at,
        });
        if !entry.is_live(now) {
            *entry = StoredValue {
                value: "0".to_string(),
                expires_at,
            };
        }
        let next = entry
            .value
            .parse::<u64>()
            .map_err(|_| StoreError::Protocol(format!("value at {} is not an integer", key)))?
            + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        match self.entries.get_mut(key) {
            Some(mut v) if v.is_live(now) => {
                v.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn sweep_expired(&self) -> usize {
        self.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hg_common::ManualClock;
    use std::sync::Arc;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        (clock.clone(), MemoryStore::new(clock))
    }

    #[tokio::test]
    async fn test_set_nx_is_first_writer_wins() {
        let (_, store) = store();
        assert!(store.set_nx_ex("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_nx_ex("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_keys_are_absent_and_reclaimable() {
        let (clock, store) = store();
        store.set_ex("k", "a", Duration::from_secs(10)).await.unwrap();
        clock.advance_secs(11);
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_nx_ex("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_incr_with_expiry_resets_after_window() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry("w", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("w", ttl).await.unwrap(), 2);
        clock.advance_secs(61);
        assert_eq!(store.incr_with_expiry("w", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_only_touches_live_keys() {
        let (clock, store) = store();
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert!(store.expire("c", Duration::from_secs(5)).await.unwrap());
        clock.advance_secs(6);
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_set_nx_has_single_winner() {
        let (_, store) = store();
        let store = Arc::new(store);
        let attempts = (0..32).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .set_nx_ex("evt", &i.to_string(), Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        });
        let winners = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
