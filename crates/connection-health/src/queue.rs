//! Background refresh job queue seam
//!
//! The scheduler only decides what to enqueue; running jobs is the queue's
//! business. Jobs carry (user, provider) and are idempotent: executing one
//! goes through `RefreshCoordinator`, which re-checks validity first.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use provider::ProviderKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Named queues, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Tokens about to expire; run immediately
    High,
    /// Delayed proactive refreshes
    Maintenance,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::High => "high",
            QueueName::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of a token refresh job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub id: Uuid,
    pub user_id: String,
    pub provider: ProviderKind,
}

impl RefreshJob {
    pub fn new(user_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            provider,
        }
    }
}

/// Fire-and-forget job submission.
pub trait JobQueue: Send + Sync {
    fn enqueue<'a>(
        &'a self,
        job: RefreshJob,
        queue: QueueName,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[cfg(test)]
pub(crate) use self::recording::MemoryQueue;
