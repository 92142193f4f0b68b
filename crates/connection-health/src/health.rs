//! Connection health tracking
//!
//! Aggregates refresh and probe outcomes into the persisted `HealthStatus`,
//! derives the consolidated status users see, and throttles live provider
//! checks.
//!
//! Live checks go through two cache entries per (operation, user, provider):
//! - `health:validation:{op}:{user}:{provider}` caches the last verdict for
//!   `validation_cache_secs`
//! - `health:rate:{op}:{user}:{provider}` counts live attempts in a fixed
//!   window of `rate_limit_window_secs`; past `rate_limit_ceiling` the live
//!   check is skipped and the persisted status returned instead

use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use connection_store::{
    ConsolidatedStatus, HealthStatus, HealthStore, RawStatus, TokenKey, TokenState, TokenStore,
};
use provider::{CloudProvider, ErrorKind, ProviderKind, ProviderRegistry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::classify::classify;
use crate::error::Result;
use crate::retry::requires_user_intervention;

/// Failure counts at which the raw status degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub degraded_after: u32,
    pub unhealthy_after: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            unhealthy_after: default_unhealthy_after(),
        }
    }
}

/// Grade a consecutive failure count into a raw status.
pub fn grade(consecutive_failures: u32, thresholds: &HealthThresholds) -> RawStatus {
    if consecutive_failures == 0 {
        RawStatus::Healthy
    } else if consecutive_failures >= thresholds.unhealthy_after {
        RawStatus::Unhealthy
    } else if consecutive_failures >= thresholds.degraded_after {
        RawStatus::Degraded
    } else {
        RawStatus::Healthy
    }
}

/// `[health]` settings
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    /// Live checks allowed per operation within one window
    #[serde(default = "default_rate_limit_ceiling")]
    pub rate_limit_ceiling: u64,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_validation_cache")]
    pub validation_cache_secs: u64,
    #[serde(default = "default_expiring_soon")]
    pub expiring_soon_secs: u64,
}

fn default_degraded_after() -> u32 {
    1
}

fn default_unhealthy_after() -> u32 {
    3
}

fn default_rate_limit_ceiling() -> u64 {
    10
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_validation_cache() -> u64 {
    300
}

fn default_expiring_soon() -> u64 {
    24 * 60 * 60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            unhealthy_after: default_unhealthy_after(),
            rate_limit_ceiling: default_rate_limit_ceiling(),
            rate_limit_window_secs: default_rate_limit_window(),
            validation_cache_secs: default_validation_cache(),
            expiring_soon_secs: default_expiring_soon(),
        }
    }
}

impl HealthConfig {
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degraded_after: self.degraded_after,
            unhealthy_after: self.unhealthy_after,
        }
    }
}

/// Expensive provider calls subject to caching and rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottledOperation {
    TokenValidation,
    ConnectivityTest,
}

impl ThrottledOperation {
    pub const ALL: [ThrottledOperation; 2] = [
        ThrottledOperation::TokenValidation,
        ThrottledOperation::ConnectivityTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottledOperation::TokenValidation => "token_validation",
            ThrottledOperation::ConnectivityTest => "connectivity_test",
        }
    }

    pub fn rate_limit_key(&self, key: &TokenKey) -> String {
        format!("health:rate:{}:{key}", self.as_str())
    }

    pub fn validation_cache_key(&self, key: &TokenKey) -> String {
        format!("health:validation:{}:{key}", self.as_str())
    }

    /// Kind recorded when the provider answers "no" without an error.
    fn rejection(&self) -> (ErrorKind, &'static str) {
        match self {
            ThrottledOperation::TokenValidation => {
                (ErrorKind::TokenExpired, "access token rejected by provider")
            }
            ThrottledOperation::ConnectivityTest => {
                (ErrorKind::Unknown, "connectivity test failed")
            }
        }
    }
}

const VERDICT_OK: &str = "ok";
const VERDICT_FAILED: &str = "failed";

/// Health summary for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub status: ConsolidatedStatus,
    pub message: String,
    pub requires_reconnection: bool,
    pub token_expired: bool,
    pub token_expiring_soon: bool,
    pub token_expires_at: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    pub last_success_at: Option<u64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn summary_message(status: ConsolidatedStatus) -> &'static str {
    match status {
        ConsolidatedStatus::Healthy => "Connection is working properly",
        ConsolidatedStatus::AuthenticationRequired => "Please reconnect your account",
        ConsolidatedStatus::ConnectionIssues => "Experiencing connectivity problems",
        ConsolidatedStatus::NotConnected => "Account not connected",
    }
}

enum Check {
    Cached,
    Live,
    Throttled,
    Failed(ConsolidatedStatus),
}

/// Health tracker for all (user, provider) connections.
pub struct HealthTracker {
    tokens: Arc<TokenStore>,
    store: Arc<HealthStore>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(
        tokens: Arc<TokenStore>,
        store: Arc<HealthStore>,
        cache: Arc<dyn CacheStore>,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        Self {
            tokens,
            store,
            cache,
            registry,
            clock,
            config,
        }
    }

    async fn token_state(&self, key: &TokenKey) -> TokenState {
        TokenState::of(self.tokens.get(key).await.as_ref())
    }

    /// Record a successful provider operation: resets the failure count and
    /// clears the reconnection flag.
    pub async fn record_success(
        &self,
        user_id: &str,
        provider: ProviderKind,
        operation: &str,
    ) -> Result<HealthStatus> {
        let key = TokenKey::new(user_id, provider);
        let token = self.token_state(&key).await;
        let now = self.clock.now_millis();
        let status = self
            .store
            .update(&key, token, |health| {
                health.consecutive_failures = 0;
                health.status = RawStatus::Healthy;
                health.requires_reconnection = false;
                health.last_successful_operation = Some(operation.to_owned());
                health.last_success_at = Some(now);
                health.last_checked_at = Some(now);
            })
            .await?;
        debug!(user_id, %provider, operation, "recorded health success");
        Ok(status)
    }

    /// Record a failed provider operation.
    pub async fn record_failure(
        &self,
        user_id: &str,
        provider: ProviderKind,
        kind: ErrorKind,
        message: &str,
    ) -> Result<HealthStatus> {
        let key = TokenKey::new(user_id, provider);
        let token = self.token_state(&key).await;
        let now = self.clock.now_millis();
        let thresholds = self.config.thresholds();
        let status = self
            .store
            .update(&key, token, |health| {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.status = grade(health.consecutive_failures, &thresholds);
                health.last_error_kind = Some(kind);
                health.last_error_message = Some(message.to_owned());
                health.last_checked_at = Some(now);
                if requires_user_intervention(kind) {
                    health.requires_reconnection = true;
                }
            })
            .await?;
        info!(
            user_id,
            %provider,
            error_kind = %kind,
            consecutive_failures = status.consecutive_failures,
            status = ?status.status,
            "recorded health failure"
        );
        Ok(status)
    }

    /// Mark the connection as disconnected and drop its cache entries.
    pub async fn mark_disconnected(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<HealthStatus> {
        let key = TokenKey::new(user_id, provider);
        let token = self.token_state(&key).await;
        let now = self.clock.now_millis();
        let status = self
            .store
            .update(&key, token, |health| {
                health.status = RawStatus::Disconnected;
                health.consecutive_failures = 0;
                health.requires_reconnection = false;
                health.last_checked_at = Some(now);
            })
            .await?;
        self.clear_caches(user_id, provider).await?;
        info!(user_id, %provider, "connection marked disconnected");
        Ok(status)
    }

    /// Store an opaque provider metadata entry (e.g. root folder id).
    pub async fn set_metadata(
        &self,
        user_id: &str,
        provider: ProviderKind,
        name: &str,
        value: serde_json::Value,
    ) -> Result<HealthStatus> {
        let key = TokenKey::new(user_id, provider);
        let token = self.token_state(&key).await;
        let status = self
            .store
            .update(&key, token, |health| {
                health.provider_metadata.insert(name.to_owned(), value);
            })
            .await?;
        Ok(status)
    }

    /// Consolidated status from persisted state only; no provider calls.
    pub async fn get_consolidated_status(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> ConsolidatedStatus {
        let key = TokenKey::new(user_id, provider);
        let token = self.token_state(&key).await;
        let health = self
            .store
            .get(&key)
            .await
            .unwrap_or_else(|| HealthStatus::new(&key));
        ConsolidatedStatus::derive(health.status, health.requires_reconnection, token)
    }

    /// Consolidated status backed by live provider checks, subject to the
    /// validation cache and per-operation rate limits.
    pub async fn determine_consolidated_status(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<ConsolidatedStatus> {
        let key = TokenKey::new(user_id, provider);
        let Some(token) = self.tokens.get(&key).await else {
            return Ok(ConsolidatedStatus::NotConnected);
        };
        if token.requires_user_intervention {
            return Ok(ConsolidatedStatus::AuthenticationRequired);
        }
        let Some(client) = self.registry.get(provider) else {
            let status = self
                .record_failure(
                    user_id,
                    provider,
                    ErrorKind::ProviderNotConfigured,
                    "no client registered for provider",
                )
                .await?;
            return Ok(status.consolidated_status);
        };

        let mut live = false;
        for operation in ThrottledOperation::ALL {
            match self
                .check(&key, operation, client.as_ref(), token.access_token.expose())
                .await?
            {
                Check::Cached => {}
                Check::Live => live = true,
                Check::Throttled => {
                    return Ok(self.get_consolidated_status(user_id, provider).await);
                }
                Check::Failed(status) => return Ok(status),
            }
        }

        if live {
            let status = self
                .record_success(user_id, provider, ThrottledOperation::ConnectivityTest.as_str())
                .await?;
            Ok(status.consolidated_status)
        } else {
            Ok(self.get_consolidated_status(user_id, provider).await)
        }
    }

    async fn check(
        &self,
        key: &TokenKey,
        operation: ThrottledOperation,
        client: &dyn CloudProvider,
        access_token: &str,
    ) -> Result<Check> {
        let cache_key = operation.validation_cache_key(key);
        if let Some(verdict) = self.cache.get(&cache_key).await? {
            if verdict == VERDICT_OK {
                return Ok(Check::Cached);
            }
            let status = self.get_consolidated_status(&key.user_id, key.provider).await;
            return Ok(Check::Failed(status));
        }

        let attempts = self
            .cache
            .increment(
                &operation.rate_limit_key(key),
                Duration::from_secs(self.config.rate_limit_window_secs),
            )
            .await?;
        if attempts > self.config.rate_limit_ceiling {
            metrics::counter!("health_checks_throttled_total", "operation" => operation.as_str())
                .increment(1);
            debug!(
                %key,
                operation = operation.as_str(),
                attempts,
                "live check rate limited, using persisted status"
            );
            return Ok(Check::Throttled);
        }

        let outcome = match operation {
            ThrottledOperation::TokenValidation => client.has_valid_connection(access_token).await,
            ThrottledOperation::ConnectivityTest => client.test_connectivity(access_token).await,
        };
        let failure = match outcome {
            Ok(true) => None,
            Ok(false) => {
                let (kind, message) = operation.rejection();
                Some((kind, message.to_owned()))
            }
            Err(e) => Some((classify(&e), e.to_string())),
        };

        let ttl = Duration::from_secs(self.config.validation_cache_secs);
        match failure {
            None => {
                self.cache.put(&cache_key, VERDICT_OK.to_owned(), ttl).await?;
                Ok(Check::Live)
            }
            Some((kind, message)) => {
                warn!(
                    %key,
                    operation = operation.as_str(),
                    error_kind = %kind,
                    error = %message,
                    "live health check failed"
                );
                let status = self
                    .record_failure(&key.user_id, key.provider, kind, &message)
                    .await?;
                self.cache.put(&cache_key, VERDICT_FAILED.to_owned(), ttl).await?;
                Ok(Check::Failed(status.consolidated_status))
            }
        }
    }

    /// Summary for display. Uses persisted state only.
    pub async fn get_health_summary(&self, user_id: &str, provider: ProviderKind) -> HealthSummary {
        let key = TokenKey::new(user_id, provider);
        let token = self.token_state(&key).await;
        let health = self
            .store
            .get(&key)
            .await
            .unwrap_or_else(|| HealthStatus::new(&key));
        let status = ConsolidatedStatus::derive(health.status, health.requires_reconnection, token);

        let expires_at = token.expires_at();
        let (token_expired, token_expiring_soon) = match (status, expires_at) {
            // Healthy means the expiry is already handled
            (ConsolidatedStatus::Healthy, _) | (_, None) => (false, false),
            (_, Some(at)) => {
                let now = self.clock.now_millis();
                let soon = now + self.config.expiring_soon_secs * 1000;
                (at <= now, at > now && at <= soon)
            }
        };

        HealthSummary {
            status,
            message: summary_message(status).to_owned(),
            requires_reconnection: status == ConsolidatedStatus::AuthenticationRequired,
            token_expired,
            token_expiring_soon,
            token_expires_at: expires_at,
            consecutive_failures: health.consecutive_failures,
            last_error_kind: health.last_error_kind,
            last_error_message: health.last_error_message,
            last_success_at: health.last_success_at,
            metadata: health.provider_metadata.into_iter().collect(),
        }
    }

    /// Every cache key the tracker may create for the pair.
    pub fn cache_keys(user_id: &str, provider: ProviderKind) -> Vec<String> {
        let key = TokenKey::new(user_id, provider);
        ThrottledOperation::ALL
            .iter()
            .flat_map(|op| [op.validation_cache_key(&key), op.rate_limit_key(&key)])
            .collect()
    }

    /// Drop cached verdicts only, keeping rate-limit counters. Used when the
    /// access token changes.
    pub async fn forget_validation(&self, user_id: &str, provider: ProviderKind) -> Result<()> {
        let key = TokenKey::new(user_id, provider);
        for op in ThrottledOperation::ALL {
            self.cache.forget(&op.validation_cache_key(&key)).await?;
        }
        Ok(())
    }

    /// Remove all cached verdicts and rate-limit counters for the pair.
    pub async fn clear_caches(&self, user_id: &str, provider: ProviderKind) -> Result<()> {
        for cache_key in Self::cache_keys(user_id, provider) {
            self.cache.forget(&cache_key).await?;
        }
        debug!(user_id, %provider, "cleared health caches");
        Ok(())
    }
}
