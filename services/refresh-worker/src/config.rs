//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The Google client secret is loaded from GOOGLE_CLIENT_SECRET or
//! client_secret_file, never stored in the TOML directly.

use common::Secret;
use connection_health::{HealthConfig, RefreshConfig, RetryConfig, SchedulerConfig};
use google_drive::{DRIVE_API_BASE, GoogleConfig, TOKEN_ENDPOINT, TOKENINFO_ENDPOINT};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    /// Without this section no provider is registered and /health reports degraded
    #[serde(default)]
    pub google: Option<GoogleSection>,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Listener, storage and job runner settings
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Directory holding `tokens.json` and `health.json`
    pub data_dir: PathBuf,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Store for refresh locks, rate-limit counters and validation verdicts.
    /// Workers sharing a `data_dir` must share a redis cache.
    #[serde(default)]
    pub cache_backend: CacheBackend,
    /// Required when `cache_backend = "redis"`
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,
    #[serde(default = "default_redis_timeout")]
    pub redis_timeout_secs: u64,
    /// Refresh jobs running at once from the high priority queue
    #[serde(default = "default_high_concurrency")]
    pub high_concurrency: usize,
    /// Refresh jobs running at once from the maintenance queue
    #[serde(default = "default_maintenance_concurrency")]
    pub maintenance_concurrency: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process only; one worker per data directory
    #[default]
    Memory,
    Redis,
}

/// Google OAuth client settings
#[derive(Debug, Deserialize)]
pub struct GoogleSection {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to GOOGLE_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_tokeninfo_url")]
    pub tokeninfo_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_cache_key_prefix() -> String {
    "refresh-worker:".to_owned()
}

fn default_redis_timeout() -> u64 {
    5
}

fn default_high_concurrency() -> usize {
    16
}

fn default_maintenance_concurrency() -> usize {
    4
}

fn default_token_url() -> String {
    TOKEN_ENDPOINT.to_owned()
}

fn default_tokeninfo_url() -> String {
    TOKENINFO_ENDPOINT.to_owned()
}

fn default_api_base_url() -> String {
    DRIVE_API_BASE.to_owned()
}

fn default_timeout() -> u64 {
    30
}

impl GoogleSection {
    /// Client settings for `GoogleDriveProvider`. Fails if no secret was resolved.
    pub fn client_config(&self) -> common::Result<GoogleConfig> {
        let secret = self.client_secret.clone().ok_or_else(|| {
            common::Error::MissingSecret(
                "GOOGLE_CLIENT_SECRET or google.client_secret_file".into(),
            )
        })?;
        let mut config = GoogleConfig::new(self.client_id.clone(), secret);
        config.token_url = self.token_url.clone();
        config.tokeninfo_url = self.tokeninfo_url.clone();
        config.api_base_url = self.api_base_url.clone();
        config.request_timeout = Duration::from_secs(self.timeout_secs);
        Ok(config)
    }
}

fn require_http(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

fn require_nonzero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. GOOGLE_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(google) = config.google.as_mut() {
            if let Ok(secret) = std::env::var("GOOGLE_CLIENT_SECRET") {
                google.client_secret = Some(Secret::new(secret));
            } else if let Some(ref secret_file) = google.client_secret_file {
                let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read client_secret_file {}: {e}",
                        secret_file.display()
                    ))
                })?;
                let secret = secret.trim().to_owned();
                if !secret.is_empty() {
                    google.client_secret = Some(Secret::new(secret));
                }
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if let Some(google) = &self.google {
            require_http("google.token_url", &google.token_url)?;
            require_http("google.tokeninfo_url", &google.tokeninfo_url)?;
            require_http("google.api_base_url", &google.api_base_url)?;
            require_nonzero("google.timeout_secs", google.timeout_secs)?;
        }
        require_nonzero("worker.drain_timeout_secs", self.worker.drain_timeout_secs)?;
        require_nonzero("worker.redis_timeout_secs", self.worker.redis_timeout_secs)?;
        require_nonzero("worker.high_concurrency", self.worker.high_concurrency as u64)?;
        require_nonzero(
            "worker.maintenance_concurrency",
            self.worker.maintenance_concurrency as u64,
        )?;
        if self.worker.cache_backend == CacheBackend::Redis {
            let url = self.worker.redis_url.as_deref().ok_or_else(|| {
                common::Error::Config("worker.redis_url is required for the redis cache".into())
            })?;
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(common::Error::Config(format!(
                    "worker.redis_url must start with redis:// or rediss://, got: {url}"
                )));
            }
        }
        require_nonzero(
            "refresh.lock_poll_interval_ms",
            self.refresh.lock_poll_interval_ms,
        )?;
        require_nonzero("refresh.lock_ttl_secs", self.refresh.lock_ttl_secs)?;
        require_nonzero(
            "refresh.request_timeout_secs",
            self.refresh.request_timeout_secs,
        )?;
        require_nonzero(
            "health.rate_limit_window_secs",
            self.health.rate_limit_window_secs,
        )?;
        require_nonzero(
            "scheduler.scan_interval_secs",
            self.scheduler.scan_interval_secs,
        )?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("refresh-worker.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch GOOGLE_CLIENT_SECRET or CONFIG_PATH.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const MINIMAL: &str = r#"
[worker]
listen_addr = "127.0.0.1:9090"
data_dir = "/var/lib/refresh-worker"
"#;

    fn with_google(extra: &str) -> String {
        format!(
            "{MINIMAL}\n[google]\nclient_id = \"123.apps.googleusercontent.com\"\n{extra}\n"
        )
    }

    fn write(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("refresh-worker.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn minimal_config_uses_component_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write(&dir, MINIMAL)).unwrap();

        assert_eq!(config.worker.listen_addr.port(), 9090);
        assert_eq!(config.worker.drain_timeout_secs, 30);
        assert!(config.google.is_none());
        assert_eq!(config.refresh.lock_wait_secs, 10);
        assert_eq!(config.refresh.expiry_margin_secs, 900);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.health.rate_limit_ceiling, 10);
        assert_eq!(config.scheduler.buffer_secs, 900);
        assert_eq!(config.scheduler.scan_interval_secs, 300);
        assert_eq!(config.scheduler.pending_grace_secs, 1800);
        assert_eq!(config.worker.cache_backend, CacheBackend::Memory);
        assert_eq!(config.worker.high_concurrency, 16);
        assert_eq!(config.worker.maintenance_concurrency, 4);
    }

    #[test]
    fn redis_cache_needs_a_redis_url() {
        let dir = tempfile::tempdir().unwrap();
        let base = "[worker]\nlisten_addr = \"127.0.0.1:9090\"\ndata_dir = \"/tmp/w\"\ncache_backend = \"redis\"\n";

        let err = Config::load(&write(&dir, base)).unwrap_err();
        assert!(err.to_string().contains("redis_url is required"), "got: {err}");

        let toml = format!("{base}redis_url = \"http://cache:6379\"\n");
        let err = Config::load(&write(&dir, &toml)).unwrap_err();
        assert!(err.to_string().contains("redis://"), "got: {err}");

        let toml = format!("{base}redis_url = \"redis://cache:6379/0\"\n");
        let config = Config::load(&write(&dir, &toml)).unwrap();
        assert_eq!(config.worker.cache_backend, CacheBackend::Redis);
        assert_eq!(config.worker.cache_key_prefix, "refresh-worker:");
    }

    #[test]
    fn sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "{MINIMAL}\n[refresh]\nlock_wait_secs = 3\n\n[health]\nunhealthy_after = 5\n\n[scheduler]\nscan_window_secs = 7200\n"
        );
        let config = Config::load(&write(&dir, &toml)).unwrap();
        assert_eq!(config.refresh.lock_wait_secs, 3);
        assert_eq!(config.refresh.lock_ttl_secs, 60);
        assert_eq!(config.health.unhealthy_after, 5);
        assert_eq!(config.scheduler.scan_window_secs, 7200);
    }

    #[test]
    fn missing_file_and_bad_toml_fail() {
        assert!(Config::load(Path::new("/nonexistent/refresh-worker.toml")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&write(&dir, "not valid {{{{ toml")).unwrap_err();
        assert!(matches!(err, common::Error::Toml(_)));
    }

    #[test]
    fn secret_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env("GOOGLE_CLIENT_SECRET", "GOCSPX-env") };
        let config = Config::load(&write(&dir, &with_google(""))).unwrap();
        unsafe { remove_env("GOOGLE_CLIENT_SECRET") };

        let google = config.google.unwrap();
        assert_eq!(google.client_secret.as_ref().unwrap().expose(), "GOCSPX-env");
        assert_eq!(google.token_url, TOKEN_ENDPOINT);
        let client = google.client_config().unwrap();
        assert_eq!(client.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn secret_from_file_and_env_wins() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("client_secret");
        std::fs::write(&secret_path, "GOCSPX-file\n").unwrap();
        let toml = with_google(&format!(
            "client_secret_file = \"{}\"",
            secret_path.display()
        ));
        let path = write(&dir, &toml);

        unsafe { remove_env("GOOGLE_CLIENT_SECRET") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.google.unwrap().client_secret.unwrap().expose(),
            "GOCSPX-file"
        );

        unsafe { set_env("GOOGLE_CLIENT_SECRET", "GOCSPX-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("GOOGLE_CLIENT_SECRET") };
        assert_eq!(
            config.google.unwrap().client_secret.unwrap().expose(),
            "GOCSPX-env"
        );
    }

    #[test]
    fn unreadable_secret_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = with_google("client_secret_file = \"/nonexistent/client_secret\"");
        unsafe { remove_env("GOOGLE_CLIENT_SECRET") };
        let err = Config::load(&write(&dir, &toml)).unwrap_err();
        assert!(err.to_string().contains("client_secret_file"), "got: {err}");
    }

    #[test]
    fn no_secret_fails_at_client_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { remove_env("GOOGLE_CLIENT_SECRET") };
        let config = Config::load(&write(&dir, &with_google(""))).unwrap();
        let err = config.google.unwrap().client_config().unwrap_err();
        assert!(matches!(err, common::Error::MissingSecret(_)));
    }

    #[test]
    fn secret_never_deserialized_from_toml() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { remove_env("GOOGLE_CLIENT_SECRET") };
        let config = Config::load(&write(&dir, &with_google("client_secret = \"inline\"")))
            .unwrap();
        assert!(config.google.unwrap().client_secret.is_none());
    }

    #[test]
    fn non_http_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml = with_google("token_url = \"oauth2.googleapis.com/token\"");
        let err = Config::load(&write(&dir, &toml)).unwrap_err();
        assert!(
            err.to_string().contains("google.token_url must start with http"),
            "got: {err}"
        );
    }

    #[test]
    fn zero_intervals_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for section in [
            "[scheduler]\nscan_interval_secs = 0",
            "[refresh]\nlock_poll_interval_ms = 0",
            "[health]\nrate_limit_window_secs = 0",
        ] {
            let toml = format!("{MINIMAL}\n{section}\n");
            let err = Config::load(&write(&dir, &toml)).unwrap_err();
            assert!(err.to_string().contains("must be greater than 0"), "{section}: {err}");
        }
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("refresh-worker.toml"));

        unsafe { set_env("CONFIG_PATH", "/env/worker.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/worker.toml"));
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
