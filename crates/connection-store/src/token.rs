//! OAuth token storage
//!
//! One `Token` per (user, provider). Created when the user connects the
//! provider, mutated on every refresh attempt, deleted on disconnect.
//!
//! Timestamps are unix milliseconds. `expires_at` is absolute, computed at
//! storage time from the provider's `expires_in` delta plus the current time.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use common::Secret;
use provider::{ProviderKind, TokenData};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::persist::FileMap;

/// Identity of a connection: one user's link to one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenKey {
    pub user_id: String,
    pub provider: ProviderKind,
}

impl TokenKey {
    pub fn new(user_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.provider)
    }
}

/// A stored OAuth credential pair plus refresh bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub user_id: String,
    pub provider: ProviderKind,
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    /// Expiration as unix timestamp in milliseconds
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub consecutive_refresh_failures: u32,
    #[serde(default)]
    pub requires_user_intervention: bool,
    /// When the enqueued proactive refresh job is due (unix millis)
    #[serde(default)]
    pub refresh_scheduled_for: Option<u64>,
    /// Bumped on every successful refresh
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub last_refreshed_at: Option<u64>,
}

impl Token {
    /// Build a fresh token from a successful OAuth exchange.
    pub fn from_data(key: &TokenKey, data: TokenData, now_millis: u64) -> Self {
        Self {
            user_id: key.user_id.clone(),
            provider: key.provider,
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: data.expires_in.map(|secs| now_millis + secs * 1000),
            scopes: data.scopes,
            consecutive_refresh_failures: 0,
            requires_user_intervention: false,
            refresh_scheduled_for: None,
            version: 0,
            last_refreshed_at: None,
        }
    }

    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.user_id.clone(), self.provider)
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }

    /// Expiry set and within `window` of now (already expired counts).
    pub fn expires_within(&self, now_millis: u64, window: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now_millis + window.as_millis() as u64)
    }

    /// Usable for at least `margin` more. Tokens without an expiry never lapse.
    pub fn is_valid_for(&self, now_millis: u64, margin: Duration) -> bool {
        match self.expires_at {
            Some(at) => at > now_millis + margin.as_millis() as u64,
            None => true,
        }
    }

    /// Apply a refresh response: rotate credentials and reset bookkeeping.
    fn apply_refresh(&mut self, data: &TokenData, now_millis: u64) {
        self.access_token = data.access_token.clone();
        if let Some(refresh) = &data.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
        self.expires_at = data.expires_in.map(|secs| now_millis + secs * 1000);
        if !data.scopes.is_empty() {
            self.scopes = data.scopes.clone();
        }
        self.consecutive_refresh_failures = 0;
        self.requires_user_intervention = false;
        self.refresh_scheduled_for = None;
        self.version += 1;
        self.last_refreshed_at = Some(now_millis);
    }
}

/// Token file manager.
///
/// Reads come from memory. Every mutation goes through the file under a
/// cross-process lock, so processes sharing the data directory never
/// overwrite each other's entries. `reload` picks up changes made elsewhere.
pub struct TokenStore {
    map: FileMap<Token>,
}

impl TokenStore {
    /// Load tokens from the given file path, creating an empty store if absent.
    pub async fn load(path: PathBuf) -> Result<Self> {
        Ok(Self {
            map: FileMap::load(path).await?,
        })
    }

    pub async fn get(&self, key: &TokenKey) -> Option<Token> {
        self.map.get(&key.to_string()).await
    }

    /// Re-read the token from disk. Sees writes by other processes.
    pub async fn reload(&self, key: &TokenKey) -> Result<Option<Token>> {
        self.map.reload(&key.to_string()).await
    }

    /// Add or replace a token and persist to disk.
    pub async fn save(&self, token: Token) -> Result<()> {
        let key = token.key().to_string();
        self.map
            .mutate(|state| {
                state.insert(key.clone(), token);
                Ok(())
            })
            .await?;
        debug!(key, "saved token");
        Ok(())
    }

    /// Store the token from a completed OAuth connection, replacing any old one.
    pub async fn connect(&self, key: &TokenKey, data: TokenData, now_millis: u64) -> Result<Token> {
        let token = Token::from_data(key, data, now_millis);
        self.save(token.clone()).await?;
        Ok(token)
    }

    /// Remove a token and persist to disk. Returns the removed token if any.
    pub async fn disconnect(&self, key: &TokenKey) -> Result<Option<Token>> {
        let removed = self
            .map
            .mutate(|state| Ok(state.remove(&key.to_string())))
            .await?;
        if removed.is_some() {
            debug!(%key, "removed token");
        }
        Ok(removed)
    }

    /// Mutate an existing token and persist. Memory changes only if the
    /// write succeeds.
    async fn update<R>(&self, key: &TokenKey, f: impl FnOnce(&mut Token) -> R) -> Result<R> {
        self.map
            .mutate(|state| {
                let token = state
                    .get_mut(&key.to_string())
                    .ok_or_else(|| Error::NotFound(format!("token {key} not in store")))?;
                Ok(f(token))
            })
            .await
    }
    /// Persist refreshed credentials. Resets failures, clears the intervention
    /// flag and proactive marker, and bumps the version.
    pub async fn apply_refresh(
        &self,
        key: &TokenKey,
        data: &TokenData,
        now_millis: u64,
    ) -> Result<Token> {
        self.update(key, |token| {
            token.apply_refresh(data, now_millis);
            token.clone()
        })
        .await
    }

    /// Atomically increment the consecutive refresh failure counter.
    /// Returns the new count.
    pub async fn record_refresh_failure(&self, key: &TokenKey) -> Result<u32> {
        self.update(key, |token| {
            token.consecutive_refresh_failures += 1;
            token.consecutive_refresh_failures
        })
        .await
    }

    pub async fn set_requires_intervention(&self, key: &TokenKey, required: bool) -> Result<()> {
        self.update(key, |token| token.requires_user_intervention = required)
            .await
    }

    /// Set or clear the proactive refresh marker. Returns false if the token
    /// no longer exists.
    pub async fn set_refresh_scheduled(&self, key: &TokenKey, due_at: Option<u64>) -> Result<bool> {
        match self
            .update(key, |token| token.refresh_scheduled_for = due_at)
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Tokens with an expiry at or before `deadline_millis`, soonest first.
    /// Re-reads the file first so tokens written by other processes count.
    pub async fn expiring_before(&self, deadline_millis: u64) -> Vec<Token> {
        if let Err(e) = self.map.sync().await {
            warn!(error = %e, "could not re-read token store, scanning cached tokens");
        }
        let mut tokens: Vec<Token> = self
            .map
            .read(|state| {
                state
                    .values()
                    .filter(|t| t.expires_at.is_some_and(|at| at <= deadline_millis))
                    .cloned()
                    .collect()
            })
            .await;
        tokens.sort_by_key(|t| t.expires_at);
        tokens
    }

    pub async fn keys(&self) -> Vec<TokenKey> {
        self.map.read(|state| state.values().map(Token::key).collect()).await
    }

    pub async fn len(&self) -> usize {
        self.map.read(|state| state.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
