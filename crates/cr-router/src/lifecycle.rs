//! Lifecycle Manager - Background tasks for the command router
//!
//! Handles:
//! - Periodic health sampling
//! - Periodic endpoint probes (optional)
//! - Periodic configuration reload (optional)
//! - Graceful shutdown coordination

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::health::HealthMonitor;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for health report sampling
    pub health_sample_interval: Duration,
    /// Interval for endpoint probes; disabled when `None`
    pub endpoint_probe_interval: Option<Duration>,
    /// Interval for re-reading the configuration source; disabled when `None`
    pub config_reload_interval: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_sample_interval: Duration::from_secs(30),
            endpoint_probe_interval: Some(Duration::from_secs(60)),
            config_reload_interval: None,
        }
    }
}

/// Owns the background tasks; dropping it does not stop them, call `shutdown`
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    monitor: Arc<HealthMonitor>,
    tasks: Vec<JoinHandle<()>>,
}

impl LifecycleManager {
    /// Start all configured lifecycle tasks
    pub fn start(monitor: Arc<HealthMonitor>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        // Health sampler
        {
            let monitor = monitor.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_sample_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = monitor.sample();
                            debug!(status = ?report.status, issues = report.issues.len(), "Health sampled");
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health sampler shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Endpoint prober
        if let Some(interval) = config.endpoint_probe_interval {
            let monitor = monitor.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let probes = monitor.probe_endpoints().await;
                            let unhealthy = probes.iter().filter(|p| !p.healthy).count();
                            debug!(probed = probes.len(), unhealthy, "Endpoint probes complete");
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Endpoint prober shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Config reloader
        if let Some(interval) = config.config_reload_interval {
            let router = monitor.router().clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // First tick fires immediately; the table was just built
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = router.clone().reload_blocking().await {
                                error!(error = %e, "Periodic configuration reload failed, keeping current table");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Config reloader shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        info!(tasks = tasks.len(), "Lifecycle manager started with all background tasks");

        Self {
            shutdown_tx,
            monitor,
            tasks,
        }
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Number of background tasks still running
    pub fn running_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Signal all lifecycle tasks and wait for them to exit
    pub async fn shutdown(&mut self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Lifecycle task ended abnormally");
            }
        }
    }
}
