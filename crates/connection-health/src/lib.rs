//! Connection health and token refresh coordination
//!
//! Keeps cloud storage connections usable: refreshes OAuth tokens without
//! duplicate concurrent refreshes, classifies provider failures, tracks a
//! consolidated health status per connection, and schedules background
//! refreshes before tokens expire.
//!
//! Component flow:
//! 1. `ProactiveScheduler` enqueues refresh jobs for tokens nearing expiry
//! 2. Jobs and ad-hoc callers run `RefreshCoordinator::coordinate_refresh`
//! 3. Provider failures go through `classify` and `RetryPolicy`
//! 4. Outcomes are recorded in `HealthTracker`, which serves status summaries
//!
//! Shared mutable state (refresh locks, rate-limit counters, validation
//! verdicts) lives in an injected `CacheStore`; persisted entities live in
//! `connection_store`.

pub mod cache;
pub mod classify;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod lock;
pub mod outcome;
pub mod queue;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use cache::{CacheStore, MemoryCache, RedisCache};
pub use classify::classify;
pub use coordinator::{RefreshConfig, RefreshCoordinator};
pub use error::{Error, Result};
pub use health::{HealthConfig, HealthSummary, HealthThresholds, HealthTracker, grade};
pub use outcome::RefreshResult;
pub use queue::{JobQueue, QueueName, RefreshJob};
pub use retry::{Backoff, RetryConfig, RetryPolicy};
pub use scheduler::{ProactiveScheduler, ScheduleReport, SchedulerConfig, spawn_scan_task};
