//! Shared key-value store with TTLs and atomic counters
//!
//! Backs the refresh lock, the health rate-limit counters and the short-lived
//! validation cache. Implementations must make `add` and `increment` atomic:
//! concurrent callers never both win an `add`, and no increment is lost.
//!
//! `MemoryCache` serves a single process. Workers that share a data
//! directory must share a `RedisCache` too, or their refresh locks do not
//! see each other.

mod memory;
mod redis;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Boxed future returned by `CacheStore` methods.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key-value store with per-entry TTL.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Set `key`, replacing any existing value.
    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()>;

    /// Set `key` only if absent. Returns whether this call stored the value.
    fn add<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, bool>;

    /// Increment the counter at `key` and return the new value. A missing
    /// counter starts at zero and gets `ttl`; later increments keep its expiry.
    fn increment<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, u64>;

    /// Remove `key`. Returns whether it existed.
    fn forget<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;

    /// Remove `key` only if its value equals `owner`.
    fn forget_if_owner<'a>(&'a self, key: &'a str, owner: &'a str) -> CacheFuture<'a, bool>;
}

