//! Test helpers: a stub Google Drive client and a worker over temp storage

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Clock, Secret, SystemClock};
use connection_store::{Token, TokenKey};
use provider::{CloudProvider, ProviderFailure, ProviderKind, ProviderRegistry, TokenData};

use crate::config::Config;
use crate::worker::Worker;

#[derive(Default)]
struct StubState {
    refresh_calls: AtomicUsize,
    failure: Mutex<Option<ProviderFailure>>,
    delay: Mutex<Duration>,
}

/// Google Drive stand-in whose refreshes succeed unless told otherwise.
#[derive(Clone, Default)]
pub struct StubProvider {
    state: Arc<StubState>,
}

impl StubProvider {
    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, failure: ProviderFailure) {
        *self.state.failure.lock().unwrap() = Some(failure);
    }

    /// Make every refresh take `delay` before answering.
    pub fn delay_refresh(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }
}

impl CloudProvider for StubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn refresh_token<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<TokenData>> + Send + 'a>> {
        self.state.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.state.failure.lock().unwrap().clone();
        let delay = *self.state.delay.lock().unwrap();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match failure {
                Some(failure) => Err(failure),
                None => Ok(TokenData {
                    access_token: Secret::from("ya29.worker-refreshed"),
                    refresh_token: None,
                    expires_in: Some(3600),
                    scopes: vec![],
                }),
            }
        })
    }

    fn has_valid_connection<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<bool>> + Send + 'a>> {
        Box::pin(async { Ok(true) })
    }

    fn test_connectivity<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = provider::Result<bool>> + Send + 'a>> {
        Box::pin(async { Ok(true) })
    }
}

/// A `Worker` on the system clock with stores in a temp dir.
pub struct Stack {
    _dir: tempfile::TempDir,
    pub config: Config,
    pub worker: Arc<Worker>,
}

impl Stack {
    pub async fn new(provider: StubProvider) -> Self {
        Self::with_worker_settings(provider, "").await
    }

    /// Like `new`, with extra lines appended to the `[worker]` section.
    pub async fn with_worker_settings(provider: StubProvider, worker: &str) -> Self {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider)).unwrap();
        Self::build(registry, worker).await
    }

    pub async fn with_registry(registry: ProviderRegistry) -> Self {
        Self::build(registry, "").await
    }

    async fn build(registry: ProviderRegistry, worker: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[worker]\nlisten_addr = \"127.0.0.1:0\"\ndata_dir = \"{}\"\n{worker}\n\n[refresh]\nlock_poll_interval_ms = 10\n",
            dir.path().display()
        ))
        .unwrap();
        let worker = Worker::build(&config, registry, Arc::new(SystemClock))
            .await
            .unwrap();
        Self {
            _dir: dir,
            config,
            worker: Arc::new(worker),
        }
    }

    fn key(user: &str) -> TokenKey {
        TokenKey::new(user, ProviderKind::GoogleDrive)
    }

    /// Store a Google Drive token expiring `secs` from now.
    pub async fn connect_expiring(&self, user: &str, secs: u64) -> Token {
        let data = TokenData {
            access_token: Secret::from("ya29.initial"),
            refresh_token: Some(Secret::from("1//refresh")),
            expires_in: Some(secs),
            scopes: vec![],
        };
        self.worker
            .tokens
            .connect(&Self::key(user), data, SystemClock.now_millis())
            .await
            .unwrap()
    }

    pub async fn token(&self, user: &str) -> Token {
        self.worker.tokens.get(&Self::key(user)).await.unwrap()
    }
}
