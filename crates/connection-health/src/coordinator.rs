//! Single-flight token refresh
//!
//! `coordinate_refresh` guarantees at most one provider refresh per
//! (user, provider) at a time, across tasks and across processes sharing the
//! cache store. Callers that lose the race wait on the lock, then find the
//! token already refreshed and return without calling the provider.
//!
//! Refresh flow:
//! 1. Snapshot the token version
//! 2. Acquire `lock:token_refresh:{user}:{provider}` (bounded wait)
//! 3. Re-read the token from the store file and re-check validity under the
//!    lock, so a refresh written by another process is seen
//! 4. Call the provider, persist or classify the outcome, record health
//! 5. Release the lock (the guard's `Drop` covers cancellation)

use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use connection_store::{TokenKey, TokenStore};
use provider::{ErrorKind, ProviderFailure, ProviderKind, ProviderRegistry, TokenData};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::classify::classify;
use crate::health::HealthTracker;
use crate::lock::KeyedLock;
use crate::outcome::RefreshResult;
use crate::retry::RetryPolicy;

/// `[refresh]` settings
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// How long a caller waits for another holder's refresh
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    /// Lock lifetime if the holder never releases it
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_poll")]
    pub lock_poll_interval_ms: u64,
    /// A token expiring later than this is left alone
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_lock_wait() -> u64 {
    10
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_lock_poll() -> u64 {
    100
}

fn default_expiry_margin() -> u64 {
    15 * 60
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lock_wait_secs: default_lock_wait(),
            lock_ttl_secs: default_lock_ttl(),
            lock_poll_interval_ms: default_lock_poll(),
            expiry_margin_secs: default_expiry_margin(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Cache key of the refresh lock for a connection.
pub fn lock_key(key: &TokenKey) -> String {
    format!("lock:token_refresh:{key}")
}

/// Coordinates token refreshes for every connection.
pub struct RefreshCoordinator {
    tokens: Arc<TokenStore>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    policy: RetryPolicy,
    lock: KeyedLock,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
}

impl RefreshCoordinator {
    pub fn new(
        tokens: Arc<TokenStore>,
        registry: Arc<ProviderRegistry>,
        cache: Arc<dyn CacheStore>,
        health: Arc<HealthTracker>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        config: RefreshConfig,
    ) -> Self {
        let lock = KeyedLock::new(
            cache,
            Duration::from_secs(config.lock_ttl_secs),
            Duration::from_millis(config.lock_poll_interval_ms),
        );
        Self {
            tokens,
            registry,
            health,
            policy,
            lock,
            clock,
            config,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Refresh the token for (user, provider) unless it is still valid or
    /// another holder refreshed it meanwhile. Provider errors come back as
    /// `RefreshResult::Failure`, never as `Err`.
    pub async fn coordinate_refresh(&self, user_id: &str, provider: ProviderKind) -> RefreshResult {
        let key = TokenKey::new(user_id, provider);
        let result = self.refresh_with_lock(&key).await;

        metrics::counter!("token_refresh_total", "outcome" => result.label()).increment(1);
        if let Some(kind) = result.error_kind() {
            metrics::counter!("token_refresh_failures_total", "error_kind" => kind.as_str())
                .increment(1);
        }
        result
    }

    async fn refresh_with_lock(&self, key: &TokenKey) -> RefreshResult {
        let snapshot = self.tokens.get(key).await.map(|t| t.version);
        let lock_key = lock_key(key);
        let wait = Duration::from_secs(self.config.lock_wait_secs);

        let guard = match self.lock.acquire(&lock_key, wait).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!(%key, wait_secs = wait.as_secs(), "timed out waiting for refresh lock");
                return RefreshResult::failure(
                    ErrorKind::LockTimeout,
                    None,
                    self.policy.user_message(key.provider, ErrorKind::LockTimeout),
                );
            }
            Err(e) => {
                warn!(%key, error = %e, "refresh lock unavailable");
                return RefreshResult::failure(
                    ErrorKind::Unknown,
                    None,
                    format!("refresh lock unavailable: {e}"),
                );
            }
        };

        let result = self.refresh_locked(key, snapshot).await;

        if let Err(e) = guard.release().await {
            warn!(%key, error = %e, "failed to release refresh lock");
        }
        result
    }

    async fn refresh_locked(&self, key: &TokenKey, snapshot: Option<u64>) -> RefreshResult {
        let provider = key.provider;
        let token = match self.tokens.reload(key).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%key, error = %e, "could not re-read token under refresh lock");
                return RefreshResult::failure(
                    ErrorKind::Unknown,
                    None,
                    format!("token store unavailable: {e}"),
                );
            }
        };
        let Some(token) = token else {
            debug!(%key, "no stored token to refresh");
            return RefreshResult::failure(
                ErrorKind::TokenExpired,
                None,
                format!("No {} account connected", provider.display_name()),
            );
        };

        let now = self.clock.now_millis();
        if token.is_valid_for(now, Duration::from_secs(self.config.expiry_margin_secs)) {
            if snapshot.is_some_and(|version| version != token.version) {
                debug!(%key, version = token.version, "token refreshed by another holder");
                return RefreshResult::refreshed_by_another_process();
            }
            debug!(%key, "token still valid, skipping refresh");
            return RefreshResult::already_valid();
        }

        if token.requires_user_intervention {
            debug!(%key, "token flagged for user intervention, not calling provider");
            return RefreshResult::failure(
                ErrorKind::TokenExpired,
                None,
                self.policy.user_message(provider, ErrorKind::TokenExpired),
            );
        }

        let Some(refresh_token) = token.refresh_token.as_ref() else {
            warn!(%key, "no refresh token stored, user must reconnect");
            let message = "no refresh token stored";
            if let Err(e) = self.tokens.set_requires_intervention(key, true).await {
                warn!(%key, error = %e, "failed to flag token for intervention");
            }
            self.record_health_failure(key, ErrorKind::TokenExpired, message)
                .await;
            return RefreshResult::failure(
                ErrorKind::TokenExpired,
                None,
                self.policy.user_message(provider, ErrorKind::TokenExpired),
            );
        };

        let Some(client) = self.registry.get(provider) else {
            let cause = ProviderFailure::NotConfigured(provider);
            warn!(%key, "no client registered for provider");
            self.record_health_failure(key, ErrorKind::ProviderNotConfigured, &cause.to_string())
                .await;
            return RefreshResult::failure(
                ErrorKind::ProviderNotConfigured,
                Some(cause),
                self.policy
                    .user_message(provider, ErrorKind::ProviderNotConfigured),
            );
        };

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        debug!(%key, "calling provider token refresh");
        let outcome =
            match tokio::time::timeout(timeout, client.refresh_token(refresh_token.expose())).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderFailure::Timeout(format!(
                    "token refresh timed out after {}s",
                    timeout.as_secs()
                ))),
            };

        match outcome {
            Ok(data) => self.on_refreshed(key, data).await,
            Err(failure) => self.on_failed(key, failure).await,
        }
    }

    async fn on_refreshed(&self, key: &TokenKey, data: TokenData) -> RefreshResult {
        let now = self.clock.now_millis();
        let token = match self.tokens.apply_refresh(key, &data, now).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%key, error = %e, "provider issued new token but it could not be saved");
                return RefreshResult::failure(
                    ErrorKind::Unknown,
                    None,
                    format!("refreshed token could not be saved: {e}"),
                );
            }
        };

        if let Err(e) = self
            .health
            .record_success(&key.user_id, key.provider, "token_refresh")
            .await
        {
            warn!(%key, error = %e, "failed to record refresh success");
        }
        if let Err(e) = self.health.forget_validation(&key.user_id, key.provider).await {
            warn!(%key, error = %e, "failed to drop stale validation cache");
        }

        info!(
            %key,
            version = token.version,
            expires_at = ?token.expires_at,
            "token refreshed"
        );
        RefreshResult::success(token)
    }

    async fn on_failed(&self, key: &TokenKey, failure: ProviderFailure) -> RefreshResult {
        let kind = classify(&failure);
        let attempts = match self.tokens.record_refresh_failure(key).await {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(%key, error = %e, "failed to record refresh failure");
                1
            }
        };

        let intervention = self.policy.requires_user_intervention(kind);
        if intervention
            && let Err(e) = self.tokens.set_requires_intervention(key, true).await
        {
            warn!(%key, error = %e, "failed to flag token for intervention");
        }
        self.record_health_failure(key, kind, &failure.to_string())
            .await;

        warn!(
            %key,
            error_kind = %kind,
            error = %failure,
            attempts,
            will_retry = self.policy.should_retry(kind, attempts),
            requires_user_intervention = intervention,
            "token refresh failed"
        );
        RefreshResult::failure(kind, Some(failure), self.policy.user_message(key.provider, kind))
    }

    async fn record_health_failure(&self, key: &TokenKey, kind: ErrorKind, message: &str) {
        if let Err(e) = self
            .health
            .record_failure(&key.user_id, key.provider, kind, message)
            .await
        {
            warn!(%key, error = %e, "failed to record refresh failure in health status");
        }
    }

    /// Delay before the next refresh attempt after a failure of `kind`, or
    /// `None` when the policy allows no further attempt.
    ///
    /// Uses the persisted consecutive failure count as the attempt number.
    /// Lock timeouts do not touch that counter and count as a first attempt.
    /// When a retry is due, the token's proactive marker moves to the retry
    /// time so scans leave the retry chain alone.
    pub async fn next_retry(
        &self,
        user_id: &str,
        provider: ProviderKind,
        kind: ErrorKind,
    ) -> Option<Duration> {
        let key = TokenKey::new(user_id, provider);
        let token = self.tokens.get(&key).await?;
        if token.requires_user_intervention {
            return None;
        }
        let attempt = token.consecutive_refresh_failures.max(1);
        if !self.policy.should_retry(kind, attempt) {
            return None;
        }

        let delay = self.policy.retry_delay(kind, attempt, provider);
        let due_at = self.clock.now_millis() + delay.as_millis() as u64;
        if let Err(e) = self.tokens.set_refresh_scheduled(&key, Some(due_at)).await {
            warn!(%key, error = %e, "failed to stamp retry on proactive marker");
        }
        Some(delay)
    }
}
