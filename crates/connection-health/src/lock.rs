//! Keyed mutual exclusion over a `CacheStore`
//!
//! A lock is a cache entry holding the owner's UUID, created with `add` so only
//! one caller wins. The entry's TTL bounds how long a crashed holder can block
//! others. Waiters poll until their wait budget runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::error::Result;

/// Lock factory bound to a cache store.
#[derive(Clone)]
pub struct KeyedLock {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    poll_interval: Duration,
}

impl KeyedLock {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration, poll_interval: Duration) -> Self {
        Self {
            cache,
            ttl,
            poll_interval,
        }
    }

    /// Try to acquire `key`, waiting at most `wait`. `Ok(None)` on timeout.
    pub async fn acquire(&self, key: &str, wait: Duration) -> Result<Option<LockGuard>> {
        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            if self.cache.add(key, owner.clone(), self.ttl).await? {
                debug!(key, owner = %owner, "lock acquired");
                return Ok(Some(LockGuard {
                    cache: Arc::clone(&self.cache),
                    key: key.to_owned(),
                    owner,
                    released: false,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key, wait_ms = wait.as_millis() as u64, "lock wait exhausted");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Held lock. Release explicitly with `release`; dropping an unreleased guard
/// spawns the release on the current runtime.
pub struct LockGuard {
    cache: Arc<dyn CacheStore>,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this guard still owns it.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let removed = self.cache.forget_if_owner(&self.key, &self.owner).await?;
        if !removed {
            warn!(key = %self.key, "lock expired before release");
        }
        Ok(removed)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "no runtime to release lock, leaving it to expire");
            return;
        };
        let cache = Arc::clone(&self.cache);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = cache.forget_if_owner(&key, &owner).await {
                warn!(key = %key, error = %e, "failed to release dropped lock");
            }
        });
    }
}
