//! Per-connection health records

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use provider::{ErrorKind, ProviderKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::persist::FileMap;
use crate::token::{Token, TokenKey};

/// Raw status graded from consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
}

/// Single user-facing verdict for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidatedStatus {
    Healthy,
    AuthenticationRequired,
    ConnectionIssues,
    NotConnected,
}

impl ConsolidatedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidatedStatus::Healthy => "healthy",
            ConsolidatedStatus::AuthenticationRequired => "authentication_required",
            ConsolidatedStatus::ConnectionIssues => "connection_issues",
            ConsolidatedStatus::NotConnected => "not_connected",
        }
    }

    /// Derive the consolidated status from raw status, reconnection flag and
    /// token state.
    pub fn derive(raw: RawStatus, requires_reconnection: bool, token: TokenState) -> Self {
        match (token, raw) {
            (TokenState::Missing, _) | (_, RawStatus::Disconnected) => {
                ConsolidatedStatus::NotConnected
            }
            (TokenState::NeedsIntervention { .. }, _) => ConsolidatedStatus::AuthenticationRequired,
            _ if requires_reconnection => ConsolidatedStatus::AuthenticationRequired,
            (_, RawStatus::Healthy) => ConsolidatedStatus::Healthy,
            (_, RawStatus::Degraded | RawStatus::Unhealthy) => ConsolidatedStatus::ConnectionIssues,
        }
    }
}

impl fmt::Display for ConsolidatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the health record needs to know about the stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Missing,
    NeedsIntervention { expires_at: Option<u64> },
    Present { expires_at: Option<u64> },
}

impl TokenState {
    pub fn of(token: Option<&Token>) -> Self {
        match token {
            None => TokenState::Missing,
            Some(t) if t.requires_user_intervention => TokenState::NeedsIntervention {
                expires_at: t.expires_at,
            },
            Some(t) => TokenState::Present {
                expires_at: t.expires_at,
            },
        }
    }

    pub fn expires_at(&self) -> Option<u64> {
        match self {
            TokenState::Missing => None,
            TokenState::NeedsIntervention { expires_at } | TokenState::Present { expires_at } => {
                *expires_at
            }
        }
    }
}

/// Persisted health of one (user, provider) connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub user_id: String,
    pub provider: ProviderKind,
    pub status: RawStatus,
    pub consolidated_status: ConsolidatedStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub last_error_message: Option<String>,
    #[serde(default)]
    pub last_successful_operation: Option<String>,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    #[serde(default)]
    pub last_checked_at: Option<u64>,
    /// Token expiry as of the last mutation (unix millis)
    #[serde(default)]
    pub token_expires_at: Option<u64>,
    #[serde(default)]
    pub requires_reconnection: bool,
    #[serde(default)]
    pub provider_metadata: BTreeMap<String, serde_json::Value>,
}

impl HealthStatus {
    pub fn new(key: &TokenKey) -> Self {
        Self {
            user_id: key.user_id.clone(),
            provider: key.provider,
            status: RawStatus::Healthy,
            consolidated_status: ConsolidatedStatus::NotConnected,
            consecutive_failures: 0,
            last_error_kind: None,
            last_error_message: None,
            last_successful_operation: None,
            last_success_at: None,
            last_checked_at: None,
            token_expires_at: None,
            requires_reconnection: false,
            provider_metadata: BTreeMap::new(),
        }
    }

    /// Recompute the consolidated status and the expiry snapshot.
    pub fn refresh_consolidated(&mut self, token: TokenState) {
        self.token_expires_at = token.expires_at();
        self.consolidated_status =
            ConsolidatedStatus::derive(self.status, self.requires_reconnection, token);
    }
}

/// File-backed health records, same persistence model as `TokenStore`.
pub struct HealthStore {
    map: FileMap<HealthStatus>,
}

impl HealthStore {
    pub async fn load(path: PathBuf) -> Result<Self> {
        Ok(Self {
            map: FileMap::load(path).await?,
        })
    }

    pub async fn get(&self, key: &TokenKey) -> Option<HealthStatus> {
        self.map.get(&key.to_string()).await
    }

    /// Re-read the record from disk. Sees writes by other processes.
    pub async fn reload(&self, key: &TokenKey) -> Result<Option<HealthStatus>> {
        self.map.reload(&key.to_string()).await
    }

    /// Mutate (creating if absent) the record for `key`, recompute its
    /// consolidated status against `token`, and persist. Returns the new record.
    pub async fn update(
        &self,
        key: &TokenKey,
        token: TokenState,
        f: impl FnOnce(&mut HealthStatus),
    ) -> Result<HealthStatus> {
        let updated = self
            .map
            .mutate(|state| {
                let status = state
                    .entry(key.to_string())
                    .or_insert_with(|| HealthStatus::new(key));
                f(status);
                status.refresh_consolidated(token);
                Ok(status.clone())
            })
            .await?;
        debug!(
            %key,
            status = ?updated.status,
            consolidated = %updated.consolidated_status,
            "updated health status"
        );
        Ok(updated)
    }

    pub async fn remove(&self, key: &TokenKey) -> Result<Option<HealthStatus>> {
        self.map
            .mutate(|state| Ok(state.remove(&key.to_string())))
            .await
    }
}
