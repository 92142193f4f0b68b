//! In-process cache store

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheFuture, CacheStore};
use crate::error::{Error, Result};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process `CacheStore`. Expiry uses tokio time so tests can pause it.
///
/// A std `Mutex` guards the map; no lock is held across an await point.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T,
    ) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Cache("memory cache mutex poisoned".into()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries, now))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.with_entries(|entries, _| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        let result = self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone()));
        Box::pin(async move { result })
    }

    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()> {
        let result = self.with_entries(|entries, now| {
            entries.insert(
                key.to_owned(),
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
        });
        Box::pin(async move { result })
    }

    fn add<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, bool> {
        let result = self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_owned(),
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
            true
        });
        Box::pin(async move { result })
    }

    fn increment<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, u64> {
        let result = self.with_entries(|entries, now| {
            let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
                value: "0".to_owned(),
                expires_at: now + ttl,
            });
            let count = entry.value.parse::<u64>().unwrap_or(0).saturating_add(1);
            entry.value = count.to_string();
            count
        });
        Box::pin(async move { result })
    }

    fn forget<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        let result = self.with_entries(|entries, _| entries.remove(key).is_some());
        Box::pin(async move { result })
    }

    fn forget_if_owner<'a>(&'a self, key: &'a str, owner: &'a str) -> CacheFuture<'a, bool> {
        let result = self.with_entries(|entries, _| match entries.get(key) {
            Some(entry) if entry.value == owner => {
                entries.remove(key);
                true
            }
            _ => false,
        });
        Box::pin(async move { result })
    }
}
