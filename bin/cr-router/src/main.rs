//! Command Router Server
//!
//! Loads the routing table from a TOML file, serves the operator API and runs
//! the background health/probe/reload tasks.
//!
//! ## Environment
//!
//! - `CR_CONFIG_PATH`: routing config file (default `config/routes.toml`)
//! - `CR_HTTP_PORT`: API port (default 8080)
//! - `CR_LOG_FORMAT`: `json` for JSON logs, plain text otherwise
//! - `CR_HEALTH_SAMPLE_INTERVAL_SECS`, `CR_PROBE_INTERVAL_SECS`, `CR_CONFIG_RELOAD_INTERVAL_SECS`:
//!   background task intervals; `0` disables probes or periodic reload

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cr_api::{create_router, AppState};
use cr_config::{ConfigSource, TomlFileSource, DEFAULT_CONFIG_PATH};
use cr_router::{CommandRouter, EventBus, HealthMonitor, HealthMonitorConfig, LifecycleConfig, LifecycleManager};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, signal, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Command Router");

    // 1. Metrics recorder
    let prometheus = install_metrics_recorder();

    // 2. Configuration and router
    let config_path = std::env::var("CR_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let source: Arc<dyn ConfigSource> = Arc::new(TomlFileSource::new(&config_path));
    let router = Arc::new(
        CommandRouter::from_source(source, EventBus::default())
            .with_context(|| format!("failed to build router from {config_path}"))?,
    );

    // 3. Health monitor and lifecycle tasks
    let monitor = Arc::new(HealthMonitor::new(router.clone(), HealthMonitorConfig::default()));
    let mut lifecycle = LifecycleManager::start(monitor.clone(), load_lifecycle_config());

    // 4. HTTP API server
    let api_port: u16 = env_parse("CR_HTTP_PORT").unwrap_or(8080);
    let app = create_router(AppState {
        router: router.clone(),
        monitor,
        prometheus,
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{api_port}");
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(port = api_port, "Starting HTTP API server");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = stop_rx.await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server error");
        }
    });

    log_startup_summary(&router, &config_path);
    info!("Command Router started. Press Ctrl+C to shutdown.");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Graceful shutdown: stop admitting commands, drain, then stop serving
    router.shutdown().await;
    lifecycle.shutdown().await;

    let _ = stop_tx.send(());
    if tokio::time::timeout(SERVER_STOP_TIMEOUT, server_task).await.is_err() {
        warn!("HTTP server did not stop in time");
    }

    info!("Command Router shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CR_LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn install_metrics_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Interval in seconds from the environment; `0` disables the task
fn env_interval(key: &str, default: Option<Duration>) -> Option<Duration> {
    match env_parse::<u64>(key) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => default,
    }
}

/// Load lifecycle configuration from environment variables
fn load_lifecycle_config() -> LifecycleConfig {
    let defaults = LifecycleConfig::default();
    LifecycleConfig {
        health_sample_interval: env_interval("CR_HEALTH_SAMPLE_INTERVAL_SECS", Some(defaults.health_sample_interval))
            .unwrap_or(defaults.health_sample_interval),
        endpoint_probe_interval: env_interval("CR_PROBE_INTERVAL_SECS", defaults.endpoint_probe_interval),
        config_reload_interval: env_interval("CR_CONFIG_RELOAD_INTERVAL_SECS", defaults.config_reload_interval),
    }
}

fn log_startup_summary(router: &CommandRouter, config_path: &str) {
    let table = router.table();
    let settings = router.settings();

    info!("=== Command Router Startup Summary ===");
    info!("  Config: {}", config_path);
    info!("  Environment: {}", table.environment());
    info!("  Routes: {} ({} enabled)", table.len(), table.enabled_count());
    for (command_type, reason) in table.invalid_routes() {
        warn!("  Invalid route '{}': {}", command_type, reason);
    }
    info!(
        "  Concurrency: {} (queue {}, {})",
        settings.max_concurrent_requests,
        settings.queue_size,
        if settings.queue_enabled { "enabled" } else { "disabled" }
    );
    match settings.rate_limit_per_minute {
        Some(limit) => info!("  Rate limit: {}/min", limit),
        None => info!("  Rate limit: none"),
    }
    info!("======================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
