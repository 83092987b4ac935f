use std::time::Duration;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;

use super::{CacheStore, StoreError};
use crate::config::WritePolicy;

/// In-process store with the same TTL semantics as the Redis store.
///
/// Expiry is measured on the tokio clock, so paused-time tests can move
/// entries past their TTL without sleeping.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        {
            let Some(entry) = self.entries.get(key) else {
                return Ok(None);
            };
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }

        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        policy: WritePolicy,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let entry = MemoryEntry {
            value,
            expires_at: now + ttl,
        };

        match policy {
            WritePolicy::Overwrite => {
                self.entries.insert(key.to_owned(), entry);
            }
            WritePolicy::IfAbsent => match self.entries.entry(key.to_owned()) {
                Entry::Occupied(existing) if existing.get().is_live(now) => {
                    return Err(StoreError::KeyExists(key.to_owned()));
                }
                Entry::Occupied(mut expired) => {
                    expired.insert(entry);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(entry);
                }
            },
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
