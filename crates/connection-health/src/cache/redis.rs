//! Redis cache store for workers running as several processes
//!
//! Every key is prefixed so one Redis can serve several deployments.
//! `add` is `SET NX PX`; `increment` and `forget_if_owner` run as Lua scripts
//! so the check and the write happen in one step on the server.

use std::time::Duration;

use ::redis::aio::{ConnectionManager, ConnectionManagerConfig};
use ::redis::{AsyncCommands, RedisError, Script};
use tracing::{error, info};

use super::{CacheFuture, CacheStore};
use crate::error::{Error, Result};

/// INCR, and set the window TTL only when the counter was just created.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Delete the key only while it still holds the caller's owner id.
const FORGET_IF_OWNER_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// `CacheStore` over a shared Redis, reconnecting through `ConnectionManager`.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    prefix: String,
    increment: Script,
    forget_if_owner: Script,
}

impl RedisCache {
    /// Connect to `url` (`redis://` or `rediss://`). `timeout` bounds both
    /// connecting and each command.
    pub async fn connect(url: &str, prefix: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| Error::Cache(format!("invalid redis url: {e}")))?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(timeout)
            .set_response_timeout(timeout);
        let manager = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| Error::Cache(format!("failed to connect to redis: {e}")))?;

        let prefix = prefix.into();
        info!(%prefix, "connected to redis cache");
        Ok(Self {
            manager,
            prefix,
            increment: Script::new(INCREMENT_SCRIPT),
            forget_if_owner: Script::new(FORGET_IF_OWNER_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

/// Redis rejects a zero `PX`.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_error(op: &'static str) -> impl FnOnce(RedisError) -> Error {
    move |e| {
        error!(op, error = %e, "redis command failed");
        Error::Cache(format!("redis {op} failed: {e}"))
    }
}

impl CacheStore for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn
                .get(self.key(key))
                .await
                .map_err(command_error("GET"))?;
            Ok(value)
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = ::redis::cmd("SET")
                .arg(self.key(key))
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(command_error("SET"))?;
            Ok(())
        })
    }

    fn add<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let stored: Option<String> = ::redis::cmd("SET")
                .arg(self.key(key))
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(command_error("SET NX"))?;
            Ok(stored.is_some())
        })
    }

    fn increment<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let count: u64 = self
                .increment
                .key(self.key(key))
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(command_error("INCR"))?;
            Ok(count)
        })
    }

    fn forget<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: u64 = conn.del(self.key(key)).await.map_err(command_error("DEL"))?;
            Ok(removed > 0)
        })
    }

    fn forget_if_owner<'a>(&'a self, key: &'a str, owner: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: u64 = self
                .forget_if_owner
                .key(self.key(key))
                .arg(owner)
                .invoke_async(&mut conn)
                .await
                .map_err(command_error("compare-and-delete"))?;
            Ok(removed > 0)
        })
    }
}
