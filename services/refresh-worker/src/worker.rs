//! Component wiring
//!
//! Builds the stores, cache, tracker, coordinator, scheduler and runner from
//! config. Everything is shared through `Arc` so the scan task, the runner
//! and the HTTP handlers see the same state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::Clock;
use connection_health::{
    CacheStore, HealthTracker, MemoryCache, ProactiveScheduler, RedisCache, RefreshCoordinator,
    RetryPolicy,
};
use connection_store::{HealthStore, TokenStore};
use google_drive::GoogleDriveProvider;
use provider::ProviderRegistry;
use tracing::{info, warn};

use crate::config::{CacheBackend, Config, WorkerConfig};
use crate::runner::{QueueLimits, TokioJobQueue};

/// Register a client for every configured provider section.
pub fn build_registry(config: &Config, http_client: reqwest::Client) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    if let Some(google) = &config.google {
        let client_config = google
            .client_config()
            .context("google section is present but unusable")?;
        registry.register(Arc::new(GoogleDriveProvider::new(http_client, client_config)))?;
    }
    Ok(registry)
}

/// Pick the cache named by `[worker] cache_backend`.
pub async fn build_cache(config: &WorkerConfig) -> Result<Arc<dyn CacheStore>> {
    match config.cache_backend {
        CacheBackend::Memory => {
            warn!("memory cache: refresh locks are not shared with other worker processes");
            Ok(Arc::new(MemoryCache::new()))
        }
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("worker.redis_url is required for the redis cache")?;
            let cache = RedisCache::connect(
                url,
                config.cache_key_prefix.clone(),
                Duration::from_secs(config.redis_timeout_secs),
            )
            .await
            .context("failed to connect to redis cache")?;
            Ok(Arc::new(cache))
        }
    }
}

pub struct Worker {
    pub tokens: Arc<TokenStore>,
    pub registry: Arc<ProviderRegistry>,
    pub scheduler: Arc<ProactiveScheduler>,
    pub queue: TokioJobQueue,
}

impl Worker {
    pub async fn build(
        config: &Config,
        registry: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let data_dir = &config.worker.data_dir;
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("failed to create data_dir {}", data_dir.display()))?;

        let tokens = Arc::new(
            TokenStore::load(data_dir.join("tokens.json"))
                .await
                .context("failed to load token store")?,
        );
        let health_store = Arc::new(
            HealthStore::load(data_dir.join("health.json"))
                .await
                .context("failed to load health store")?,
        );
        let cache = build_cache(&config.worker).await?;
        let registry = Arc::new(registry);

        let tracker = Arc::new(HealthTracker::new(
            tokens.clone(),
            health_store,
            cache.clone(),
            registry.clone(),
            clock.clone(),
            config.health.clone(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            tokens.clone(),
            registry.clone(),
            cache,
            tracker,
            RetryPolicy::new(config.retry.clone()),
            clock.clone(),
            config.refresh.clone(),
        ));
        let queue = TokioJobQueue::new(
            coordinator,
            QueueLimits {
                high: config.worker.high_concurrency,
                maintenance: config.worker.maintenance_concurrency,
            },
        );
        let scheduler = Arc::new(ProactiveScheduler::new(
            tokens.clone(),
            Arc::new(queue.clone()),
            clock,
            config.scheduler.clone(),
        ));

        info!(
            connections = tokens.len().await,
            providers = ?registry.kinds(),
            "worker components ready"
        );

        Ok(Self {
            tokens,
            registry,
            scheduler,
            queue,
        })
    }
}
