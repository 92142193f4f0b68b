//! Shared test fixtures: a scriptable provider and a wired-up stack

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{ManualClock, Secret};
use connection_store::{HealthStore, Token, TokenKey, TokenStore};
use provider::{CloudProvider, ProviderFailure, ProviderKind, ProviderRegistry, TokenData};

use crate::cache::MemoryCache;
use crate::coordinator::{RefreshConfig, RefreshCoordinator};
use crate::health::{HealthConfig, HealthTracker};
use crate::retry::RetryPolicy;

/// Fixed "now" for tests (unix millis).
pub(crate) const NOW: u64 = 1_760_000_000_000;

pub(crate) fn token_data(expires_in: Option<u64>) -> TokenData {
    TokenData {
        access_token: Secret::from("ya29.initial"),
        refresh_token: Some(Secret::from("1//refresh")),
        expires_in,
        scopes: vec!["https://www.googleapis.com/auth/drive.file".into()],
    }
}

#[derive(Default)]
struct MockState {
    refresh_calls: AtomicUsize,
    validation_calls: AtomicUsize,
    connectivity_calls: AtomicUsize,
    token_invalid: AtomicBool,
    refresh_failure: Mutex<Option<ProviderFailure>>,
    connectivity_failure: Mutex<Option<ProviderFailure>>,
    refresh_delay: Mutex<Duration>,
}

/// Google Drive stand-in that counts calls and fails on demand.
#[derive(Clone, Default)]
pub(crate) struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub(crate) fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn validation_calls(&self) -> usize {
        self.state.validation_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn connectivity_calls(&self) -> usize {
        self.state.connectivity_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    pub(crate) fn fail_refresh(&self, failure: ProviderFailure) {
        *self.state.refresh_failure.lock().unwrap() = Some(failure);
    }

    pub(crate) fn fail_connectivity(&self, failure: ProviderFailure) {
        *self.state.connectivity_failure.lock().unwrap() = Some(failure);
    }

    pub(crate) fn set_token_valid(&self, valid: bool) {
        self.state.token_invalid.store(!valid, Ordering::SeqCst);
    }
}

impl CloudProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn refresh_token<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<TokenData>> + Send + 'a>> {
        let n = self.state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.state.refresh_delay.lock().unwrap();
        let failure = self.state.refresh_failure.lock().unwrap().clone();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(failure) = failure {
                return Err(failure);
            }
            Ok(TokenData {
                access_token: Secret::new(format!("ya29.refreshed-{n}")),
                refresh_token: None,
                expires_in: Some(3600),
                scopes: vec![],
            })
        })
    }

    fn has_valid_connection<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<bool>> + Send + 'a>> {
        self.state.validation_calls.fetch_add(1, Ordering::SeqCst);
        let valid = !self.state.token_invalid.load(Ordering::SeqCst);
        Box::pin(async move { Ok(valid) })
    }

    fn test_connectivity<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<bool>> + Send + 'a>> {
        self.state.connectivity_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.state.connectivity_failure.lock().unwrap().clone();
        Box::pin(async move {
            match failure {
                Some(failure) => Err(failure),
                None => Ok(true),
            }
        })
    }
}

/// Stores in a temp dir, an in-memory cache, a pinned clock, and a tracker
/// and coordinator wired to a `MockProvider`.
pub(crate) struct Fixture {
    dir: tempfile::TempDir,
    pub(crate) tokens: Arc<TokenStore>,
    pub(crate) health: Arc<HealthStore>,
    pub(crate) cache: Arc<MemoryCache>,
    pub(crate) tracker: Arc<HealthTracker>,
    pub(crate) coordinator: Arc<RefreshCoordinator>,
    clock: Arc<ManualClock>,
    health_config: HealthConfig,
    refresh_config: RefreshConfig,
}

/// Components of one worker process over a shared data dir and cache.
pub(crate) struct Process {
    pub(crate) tokens: Arc<TokenStore>,
    pub(crate) health: Arc<HealthStore>,
    pub(crate) tracker: Arc<HealthTracker>,
    pub(crate) coordinator: Arc<RefreshCoordinator>,
}

impl Process {
    async fn start(
        dir: &Path,
        provider: MockProvider,
        cache: Arc<MemoryCache>,
        clock: Arc<ManualClock>,
        health_config: HealthConfig,
        refresh_config: RefreshConfig,
    ) -> Self {
        let tokens = Arc::new(TokenStore::load(dir.join("tokens.json")).await.unwrap());
        let health = Arc::new(HealthStore::load(dir.join("health.json")).await.unwrap());

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();
        let registry = Arc::new(registry);

        let tracker = Arc::new(HealthTracker::new(
            tokens.clone(),
            health.clone(),
            cache.clone(),
            registry.clone(),
            clock.clone(),
            health_config,
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            tokens.clone(),
            registry,
            cache,
            tracker.clone(),
            RetryPolicy::default(),
            clock,
            refresh_config,
        ));
        Self {
            tokens,
            health,
            tracker,
            coordinator,
        }
    }
}

impl Fixture {
    pub(crate) async fn new(provider: MockProvider) -> Self {
        Self::build(provider, HealthConfig::default(), fast_refresh_config()).await
    }

    pub(crate) async fn with_health_config(provider: MockProvider, config: HealthConfig) -> Self {
        Self::build(provider, config, fast_refresh_config()).await
    }

    pub(crate) async fn with_refresh_config(provider: MockProvider, config: RefreshConfig) -> Self {
        Self::build(provider, HealthConfig::default(), config).await
    }

    async fn build(
        provider: MockProvider,
        health_config: HealthConfig,
        refresh_config: RefreshConfig,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let process = Process::start(
            dir.path(),
            provider,
            cache.clone(),
            clock.clone(),
            health_config.clone(),
            refresh_config.clone(),
        )
        .await;

        Self {
            dir,
            tokens: process.tokens,
            health: process.health,
            cache,
            tracker: process.tracker,
            coordinator: process.coordinator,
            clock,
            health_config,
            refresh_config,
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Another worker over the same store files and the same cache.
    pub(crate) async fn second_process(&self, provider: MockProvider) -> Process {
        Process::start(
            self.dir(),
            provider,
            self.cache.clone(),
            self.clock.clone(),
            self.health_config.clone(),
            self.refresh_config.clone(),
        )
        .await
    }

    pub(crate) fn key(&self, user: &str) -> TokenKey {
        TokenKey::new(user, ProviderKind::GoogleDrive)
    }

    /// Store a Google Drive token expiring `expires_in` seconds from `NOW`.
    pub(crate) async fn connect(&self, user: &str, expires_in: Option<u64>) -> Token {
        self.tokens
            .connect(&self.key(user), token_data(expires_in), NOW)
            .await
            .unwrap()
    }

    pub(crate) async fn connect_expiring_at(&self, user: &str, expires_at: u64) -> Token {
        let mut token = Token::from_data(&self.key(user), token_data(None), NOW);
        token.expires_at = Some(expires_at);
        self.tokens.save(token.clone()).await.unwrap();
        token
    }

    pub(crate) async fn connect_without_refresh_token(
        &self,
        user: &str,
        expires_in: Option<u64>,
    ) -> Token {
        let mut data = token_data(expires_in);
        data.refresh_token = None;
        self.tokens.connect(&self.key(user), data, NOW).await.unwrap()
    }
}

fn fast_refresh_config() -> RefreshConfig {
    RefreshConfig {
        lock_poll_interval_ms: 10,
        ..RefreshConfig::default()
    }
}
