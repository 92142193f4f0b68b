//! Token refresh worker
//!
//! Single-binary service that:
//! 1. Loads stored cloud storage connections from the data directory
//! 2. Periodically scans for tokens nearing expiry and schedules refresh jobs
//! 3. Runs those jobs in-process through the refresh coordinator
//! 4. Serves `/health` and `/metrics` for the service stack

mod config;
mod metrics;
mod runner;
#[cfg(test)]
mod testing;
mod worker;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use common::SystemClock;
use connection_health::spawn_scan_task;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::worker::{Worker, build_registry};

/// Operational endpoints only; a small limit keeps scrapes from piling up.
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    worker: Arc<Worker>,
    worker_id: uuid::Uuid,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            MAX_CONCURRENT_REQUESTS,
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let worker_id = uuid::Uuid::new_v4();
    info!(%worker_id, "starting refresh-worker");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.worker.listen_addr,
        data_dir = %config.worker.data_dir.display(),
        google = config.google.is_some(),
        scan_interval_secs = config.scheduler.scan_interval_secs,
        "configuration loaded"
    );

    let registry = build_registry(&config, reqwest::Client::new())?;
    if registry.kinds().is_empty() {
        warn!("no providers configured, refresh jobs will fail with provider_not_configured");
    }

    let worker = Arc::new(Worker::build(&config, registry, Arc::new(SystemClock)).await?);

    let scan_task = spawn_scan_task(
        worker.scheduler.clone(),
        Duration::from_secs(config.scheduler.scan_interval_secs),
        Duration::from_secs(config.scheduler.scan_window_secs),
    );

    let app = build_router(AppState {
        worker: worker.clone(),
        worker_id,
        started_at: Instant::now(),
        prometheus,
    });

    let listen_addr = config.worker.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt: stop scanning, close the
    // runner, let axum finish in-flight requests, then wait for running jobs.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    scan_task.abort();
    worker.queue.close();
    let _ = shutdown_tx.send(());

    let drain_timeout = Duration::from_secs(config.worker.drain_timeout_secs);
    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => info!("http server stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "http drain timeout exceeded"
        ),
    }

    if worker.queue.drain(drain_timeout).await {
        info!("all running refresh jobs finished");
    } else {
        let stats = worker.queue.stats();
        warn!(
            remaining = stats.in_flight.load(Ordering::Relaxed),
            drain_timeout_secs = drain_timeout.as_secs(),
            "drain timeout exceeded, abandoning running jobs"
        );
    }

    info!("shutdown complete");
    Ok(())
}

/// Returns 200 while the runner accepts jobs and at least one provider is
/// registered, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.worker.registry.kinds();
    let accepting = !state.worker.queue.is_closed();
    let healthy = accepting && !providers.is_empty();

    let status_code = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "worker_id": state.worker_id.to_string(),
        "providers": providers.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        "accepting_jobs": accepting,
        "connections": state.worker.tokens.len().await,
        "jobs": state.worker.queue.stats().snapshot(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
