//! Proactive background token refresh scheduling
//!
//! Decides whether and when a token gets a background refresh job, so tokens
//! are renewed before users hit an expired one. Tokens close to expiry go on
//! the high priority queue immediately; the rest are delayed on the
//! maintenance queue until `expiry - buffer`.
//!
//! Each scheduled token is stamped with `refresh_scheduled_for`, the time its
//! job is due. A scan treats the token as already scheduled until
//! `pending_grace` has passed beyond that time, which covers the job while it
//! runs. The job runner moves the marker forward on every retry, so a retry
//! chain keeps the token claimed. A marker whose grace has run out means the
//! job was lost, and the next scan schedules a new one.

use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use connection_store::{Token, TokenStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::{JobQueue, QueueName, RefreshJob};

/// `[scheduler]` settings
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Refresh this long before expiry
    #[serde(default = "default_buffer")]
    pub buffer_secs: u64,
    /// Tokens expiring later than this are not scheduled yet
    #[serde(default = "default_ceiling")]
    pub ceiling_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Expiry window covered by each periodic scan
    #[serde(default = "default_scan_window")]
    pub scan_window_secs: u64,
    /// How long after its due time a marker still blocks rescheduling
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,
}

fn default_buffer() -> u64 {
    15 * 60
}

fn default_ceiling() -> u64 {
    24 * 60 * 60
}

fn default_scan_interval() -> u64 {
    5 * 60
}

fn default_scan_window() -> u64 {
    60 * 60
}

fn default_pending_grace() -> u64 {
    30 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_secs: default_buffer(),
            ceiling_secs: default_ceiling(),
            scan_interval_secs: default_scan_interval(),
            scan_window_secs: default_scan_window(),
            pending_grace_secs: default_pending_grace(),
        }
    }
}

/// Counts from one batch scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub total: usize,
    pub scheduled: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ProactiveScheduler {
    tokens: Arc<TokenStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl ProactiveScheduler {
    pub fn new(
        tokens: Arc<TokenStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tokens,
            queue,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether `token` carries a marker for a job that may still run.
    pub fn is_pending(&self, token: &Token, now_millis: u64) -> bool {
        let grace = self.config.pending_grace_secs * 1000;
        token
            .refresh_scheduled_for
            .is_some_and(|due| due.saturating_add(grace) > now_millis)
    }

    /// Enqueue a refresh job for `token` if it expires within the ceiling.
    ///
    /// Returns `Ok(false)` when nothing was scheduled: no expiry, flagged for
    /// user intervention, expiry beyond the ceiling, or the token was deleted
    /// before it could be stamped.
    pub async fn schedule_refresh_for_token(&self, token: &Token) -> Result<bool> {
        let key = token.key();
        let Some(expires_at) = token.expires_at else {
            debug!(%key, "token has no expiry, nothing to schedule");
            return Ok(false);
        };
        if token.requires_user_intervention {
            debug!(%key, "token requires user intervention, not scheduling");
            return Ok(false);
        }

        let now = self.clock.now_millis();
        let ceiling = now + self.config.ceiling_secs * 1000;
        if expires_at > ceiling {
            debug!(%key, expires_at, "expiry beyond scheduling ceiling");
            return Ok(false);
        }

        let buffer_millis = self.config.buffer_secs * 1000;
        let (queue, delay) = if expires_at <= now + buffer_millis {
            (QueueName::High, Duration::ZERO)
        } else {
            let due = expires_at - buffer_millis;
            (QueueName::Maintenance, Duration::from_millis(due - now))
        };

        let job = RefreshJob::new(key.user_id.clone(), key.provider);
        let job_id = job.id;
        self.queue.enqueue(job, queue, delay).await?;

        let due_at = now + delay.as_millis() as u64;
        let stamped = self.tokens.set_refresh_scheduled(&key, Some(due_at)).await?;
        if !stamped {
            warn!(%key, %job_id, "token deleted while scheduling refresh");
            return Ok(false);
        }

        metrics::counter!("proactive_refresh_scheduled_total", "queue" => queue.as_str())
            .increment(1);
        info!(
            %key,
            %job_id,
            queue = queue.as_str(),
            delay_secs = delay.as_secs(),
            "proactive refresh scheduled"
        );
        Ok(true)
    }

    /// Schedule every token expiring within `window`, including already
    /// expired ones. Tokens with a pending job are skipped. Per-token errors
    /// are counted and never abort the scan.
    pub async fn schedule_all_expiring_tokens(&self, window: Duration) -> ScheduleReport {
        let now = self.clock.now_millis();
        let deadline = now + window.as_millis() as u64;
        let tokens = self.tokens.expiring_before(deadline).await;

        let mut report = ScheduleReport {
            total: tokens.len(),
            ..ScheduleReport::default()
        };
        for token in &tokens {
            if self.is_pending(token, now) {
                report.skipped += 1;
                continue;
            }
            match self.schedule_refresh_for_token(token).await {
                Ok(true) => report.scheduled += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %token.key(), error = %e, "failed to schedule proactive refresh");
                    report.failed += 1;
                }
            }
        }

        info!(
            total = report.total,
            scheduled = report.scheduled,
            skipped = report.skipped,
            failed = report.failed,
            "proactive refresh scan complete"
        );
        report
    }

    /// Clear the scheduling marker. Does not recall an enqueued job; the job
    /// re-checks validity when it runs. Returns whether the token exists.
    pub async fn cancel_scheduled_refresh(&self, token: &Token) -> Result<bool> {
        let key = token.key();
        let cleared = self.tokens.set_refresh_scheduled(&key, None).await?;
        debug!(%key, cleared, "cancelled scheduled refresh");
        Ok(cleared)
    }
}

/// Spawn a background task that scans for expiring tokens every `interval`.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_scan_task(
    scheduler: Arc<ProactiveScheduler>,
    interval: Duration,
    window: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            scheduler.schedule_all_expiring_tokens(window).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::testing::{NOW, token_data};
    use common::ManualClock;
    use connection_store::TokenKey;
    use provider::ProviderKind;

    const MINUTE: u64 = 60_000;

    struct Setup {
        _dir: tempfile::TempDir,
        tokens: Arc<TokenStore>,
        queue: Arc<MemoryQueue>,
        clock: Arc<ManualClock>,
        scheduler: Arc<ProactiveScheduler>,
    }

    async fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(
            TokenStore::load(dir.path().join("tokens.json"))
                .await
                .unwrap(),
        );
        let queue = Arc::new(MemoryQueue::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let scheduler = Arc::new(ProactiveScheduler::new(
            tokens.clone(),
            queue.clone(),
            clock.clone(),
            SchedulerConfig::default(),
        ));
        Setup {
            _dir: dir,
            tokens,
            queue,
            clock,
            scheduler,
        }
    }

    async fn token_expiring_in(s: &Setup, user: &str, millis: Option<u64>) -> Token {
        let key = TokenKey::new(user, ProviderKind::GoogleDrive);
        let mut token = Token::from_data(&key, token_data(None), NOW);
        token.expires_at = millis.map(|m| NOW + m);
        s.tokens.save(token.clone()).await.unwrap();
        token
    }

    #[tokio::test]
    async fn token_inside_buffer_gets_immediate_high_priority_job() {
        let s = setup().await;
        let token = token_expiring_in(&s, "u1", Some(10 * MINUTE)).await;

        assert!(s.scheduler.schedule_refresh_for_token(&token).await.unwrap());
        let jobs = s.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, QueueName::High);
        assert_eq!(jobs[0].delay, Duration::ZERO);
        assert_eq!(jobs[0].job.user_id, "u1");

        let stored = s.tokens.get(&token.key()).await.unwrap();
        assert_eq!(stored.refresh_scheduled_for, Some(NOW));
    }

    #[tokio::test]
    async fn token_expiring_in_two_hours_gets_delayed_maintenance_job() {
        let s = setup().await;
        let token = token_expiring_in(&s, "u1", Some(120 * MINUTE)).await;

        assert!(s.scheduler.schedule_refresh_for_token(&token).await.unwrap());
        let jobs = s.queue.jobs_on(QueueName::Maintenance);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].delay, Duration::from_secs(105 * 60));

        let stored = s.tokens.get(&token.key()).await.unwrap();
        assert_eq!(stored.refresh_scheduled_for, Some(NOW + 105 * MINUTE));
    }

    #[tokio::test]
    async fn token_beyond_ceiling_is_not_scheduled() {
        let s = setup().await;
        let token = token_expiring_in(&s, "u1", Some(30 * 60 * MINUTE)).await;

        assert!(!s.scheduler.schedule_refresh_for_token(&token).await.unwrap());
        assert!(s.queue.jobs().is_empty());
        assert_eq!(s.tokens.get(&token.key()).await.unwrap().refresh_scheduled_for, None);
    }

    #[tokio::test]
    async fn no_expiry_or_flagged_is_not_scheduled() {
        let s = setup().await;
        let forever = token_expiring_in(&s, "u1", None).await;
        assert!(!s.scheduler.schedule_refresh_for_token(&forever).await.unwrap());

        let mut flagged = token_expiring_in(&s, "u2", Some(5 * MINUTE)).await;
        flagged.requires_user_intervention = true;
        assert!(!s.scheduler.schedule_refresh_for_token(&flagged).await.unwrap());
        assert!(s.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn batch_counts_scheduled_and_skipped() {
        let s = setup().await;
        token_expiring_in(&s, "a", Some(20 * MINUTE)).await;
        token_expiring_in(&s, "b", Some(25 * MINUTE)).await;
        let flagged = token_expiring_in(&s, "c", Some(15 * MINUTE)).await;
        s.tokens
            .set_requires_intervention(&flagged.key(), true)
            .await
            .unwrap();
        // Outside the window
        token_expiring_in(&s, "d", Some(90 * MINUTE)).await;

        let report = s
            .scheduler
            .schedule_all_expiring_tokens(Duration::from_secs(30 * 60))
            .await;
        assert_eq!(
            report,
            ScheduleReport {
                total: 3,
                scheduled: 2,
                failed: 0,
                skipped: 1,
            }
        );
    }

    #[tokio::test]
    async fn rescan_skips_tokens_with_future_marker() {
        let s = setup().await;
        token_expiring_in(&s, "a", Some(20 * MINUTE)).await;
        let window = Duration::from_secs(30 * 60);

        let first = s.scheduler.schedule_all_expiring_tokens(window).await;
        assert_eq!(first.scheduled, 1);

        let second = s.scheduler.schedule_all_expiring_tokens(window).await;
        assert_eq!(second.scheduled, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(s.queue.jobs().len(), 1);

        // Job due at +5m; still claimed while it may be running
        s.clock.advance_secs(6 * 60);
        let third = s.scheduler.schedule_all_expiring_tokens(window).await;
        assert_eq!(third.scheduled, 0);

        // Grace over: the job is presumed lost
        s.clock.advance_secs(30 * 60);
        let fourth = s.scheduler.schedule_all_expiring_tokens(window).await;
        assert_eq!(fourth.scheduled, 1);
        assert_eq!(s.queue.jobs().len(), 2);
    }

    #[tokio::test]
    async fn immediate_job_is_not_rescheduled_by_later_scans() {
        let s = setup().await;
        token_expiring_in(&s, "a", Some(10 * MINUTE)).await;
        let window = Duration::from_secs(30 * 60);

        assert_eq!(s.scheduler.schedule_all_expiring_tokens(window).await.scheduled, 1);
        assert_eq!(s.scheduler.schedule_all_expiring_tokens(window).await.scheduled, 0);
        s.clock.advance_secs(1);
        let later = s.scheduler.schedule_all_expiring_tokens(window).await;
        assert_eq!(later.scheduled, 0);
        assert_eq!(later.skipped, 1);

        let jobs = s.queue.jobs_on(QueueName::High);
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn marker_moved_by_retry_keeps_token_claimed() {
        let s = setup().await;
        let token = token_expiring_in(&s, "a", Some(5 * MINUTE)).await;
        let window = Duration::from_secs(30 * 60);
        s.scheduler.schedule_all_expiring_tokens(window).await;

        // Runner retried, next attempt due in 40 minutes
        s.clock.advance_secs(20 * 60);
        let due = s.clock.now_millis() + 40 * MINUTE;
        s.tokens.set_refresh_scheduled(&token.key(), Some(due)).await.unwrap();

        s.clock.advance_secs(45 * 60);
        let report = s.scheduler.schedule_all_expiring_tokens(window).await;
        assert_eq!(report.scheduled, 0);
        assert_eq!(s.queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn queue_errors_count_as_failed_without_aborting() {
        let s = setup().await;
        token_expiring_in(&s, "a", Some(5 * MINUTE)).await;
        token_expiring_in(&s, "b", Some(10 * MINUTE)).await;
        s.queue.set_rejecting(true);

        let report = s
            .scheduler
            .schedule_all_expiring_tokens(Duration::from_secs(30 * 60))
            .await;
        assert_eq!(report.total, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.scheduled, 0);
    }

    #[tokio::test]
    async fn already_expired_tokens_are_included() {
        let s = setup().await;
        let key = TokenKey::new("old", ProviderKind::GoogleDrive);
        let mut token = Token::from_data(&key, token_data(None), NOW);
        token.expires_at = Some(NOW - 60 * MINUTE);
        s.tokens.save(token).await.unwrap();

        let report = s
            .scheduler
            .schedule_all_expiring_tokens(Duration::from_secs(30 * 60))
            .await;
        assert_eq!(report.scheduled, 1);
        assert_eq!(s.queue.jobs_on(QueueName::High).len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let s = setup().await;
        let token = token_expiring_in(&s, "a", Some(10 * MINUTE)).await;
        s.scheduler.schedule_refresh_for_token(&token).await.unwrap();

        assert!(s.scheduler.cancel_scheduled_refresh(&token).await.unwrap());
        assert!(s.scheduler.cancel_scheduled_refresh(&token).await.unwrap());
        assert_eq!(s.tokens.get(&token.key()).await.unwrap().refresh_scheduled_for, None);

        s.tokens.disconnect(&token.key()).await.unwrap();
        assert!(!s.scheduler.cancel_scheduled_refresh(&token).await.unwrap());
    }

    #[tokio::test]
    async fn scan_task_runs_on_interval() {
        let s = setup().await;
        token_expiring_in(&s, "a", Some(10 * MINUTE)).await;

        let handle = spawn_scan_task(
            s.scheduler.clone(),
            Duration::from_secs(300),
            Duration::from_secs(30 * 60),
        );
        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(s.queue.jobs().len(), 1);
        handle.abort();
    }
}
