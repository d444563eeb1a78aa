//! HealthMonitor - sampled view of breaker, admission and executor state
//!
//! Sampling is passive: it reads component stats and the last endpoint
//! probes. Probing is a separate, explicit step (`probe_endpoints`).

use std::sync::Arc;

use chrono::Utc;
use cr_common::{CircuitState, EndpointHealth, HealthReport, HealthStatus};
use metrics::gauge;
use parking_lot::RwLock;

use crate::events::RouterEvent;
use crate::router::CommandRouter;

/// Thresholds used to raise issues in a report
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Limiter utilization (percent) at or above which a warning is raised
    pub utilization_warning_percent: f64,
    /// Queue depth, as a percent of queue size, at or above which a warning is raised
    pub queue_backlog_warning_percent: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            utilization_warning_percent: 90.0,
            queue_backlog_warning_percent: 50.0,
        }
    }
}

pub struct HealthMonitor {
    router: Arc<CommandRouter>,
    config: HealthMonitorConfig,
    last_report: RwLock<Option<HealthReport>>,
    last_probes: RwLock<Vec<EndpointHealth>>,
}

impl HealthMonitor {
    pub fn new(router: Arc<CommandRouter>, config: HealthMonitorConfig) -> Self {
        Self {
            router,
            config,
            last_report: RwLock::new(None),
            last_probes: RwLock::new(Vec::new()),
        }
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Build a fresh report, store it and publish it
    pub fn sample(&self) -> HealthReport {
        let table = self.router.table();
        let limiter = self.router.limiter().stats();
        let executor = self.router.executor().stats();
        let circuit_breakers = self.router.breakers().stats();
        let open_circuits = self.router.breakers().in_state(CircuitState::Open);
        let half_open_circuits = self.router.breakers().in_state(CircuitState::HalfOpen);
        let endpoints = self.last_probes.read().clone();

        let mut issues = Vec::new();
        let mut degraded = false;

        if !self.router.is_running() {
            degraded = true;
            issues.push("Router is shutting down".to_string());
        }

        for name in &open_circuits {
            issues.push(format!("Circuit open for '{name}'"));
        }
        if !open_circuits.is_empty() && open_circuits.len() * 2 >= table.enabled_count().max(1) {
            degraded = true;
        }

        if limiter.utilization_percent >= self.config.utilization_warning_percent {
            issues.push(format!(
                "Concurrency utilization at {:.0}% ({}/{})",
                limiter.utilization_percent, limiter.active, limiter.max_concurrent
            ));
        }

        if limiter.queue_size > 0 {
            let backlog = limiter.queued as f64 * 100.0 / limiter.queue_size as f64;
            if backlog >= self.config.queue_backlog_warning_percent {
                issues.push(format!("Queue backlog at {}/{}", limiter.queued, limiter.queue_size));
            }
        }

        for probe in endpoints.iter().filter(|p| !p.healthy) {
            issues.push(format!(
                "Endpoint '{}' unhealthy: {}",
                probe.command_type,
                probe.error.as_deref().unwrap_or("probe failed")
            ));
        }

        let mut invalid: Vec<_> = table.invalid_routes().collect();
        invalid.sort();
        for (command_type, reason) in invalid {
            issues.push(format!("Route '{command_type}' has invalid configuration: {reason}"));
        }

        let status = if degraded {
            HealthStatus::Degraded
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        gauge!("cr_open_circuits").set(open_circuits.len() as f64);

        let report = HealthReport {
            status,
            environment: table.environment().to_string(),
            routes_total: table.len() as u32,
            routes_enabled: table.enabled_count() as u32,
            open_circuits,
            half_open_circuits,
            limiter,
            executor,
            circuit_breakers,
            endpoints,
            issues,
            sampled_at: Utc::now(),
        };

        self.router.events().publish(RouterEvent::HealthReported {
            status: report.status,
            issues: report.issues.clone(),
        });
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Probe every enabled endpoint and keep the results for the next sample
    pub async fn probe_endpoints(&self) -> Vec<EndpointHealth> {
        let probes = self.router.health_check_all().await;
        *self.last_probes.write() = probes.clone();
        probes
    }

    /// Last stored report, sampling one if none exists yet
    pub fn report(&self) -> HealthReport {
        if let Some(report) = self.last_report.read().clone() {
            return report;
        }
        self.sample()
    }

    pub fn last_probes(&self) -> Vec<EndpointHealth> {
        self.last_probes.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use cr_config::{RouterConfig, StaticSource};

    const CONFIG: &str = r#"
environment = "test"

[router]
max_concurrent_requests = 2
queue_size = 4

[endpoints.scrape]
url = "http://127.0.0.1:9/scrape"

[endpoints.search]
url = "http://127.0.0.1:9/search"
enabled = false

[endpoints.broken]
url = "not a url"
"#;

    fn monitor() -> HealthMonitor {
        let config = RouterConfig::from_toml_str(CONFIG).unwrap();
        let source = Arc::new(StaticSource::new(config.clone()));
        let router = CommandRouter::new(config, source, EventBus::default()).unwrap();
        HealthMonitor::new(Arc::new(router), HealthMonitorConfig::default())
    }

    #[tokio::test]
    async fn test_sample_counts_routes_and_invalid_entries() {
        let monitor = monitor();
        let report = monitor.sample();

        assert_eq!(report.environment, "test");
        assert_eq!(report.routes_total, 2);
        assert_eq!(report.routes_enabled, 1);
        assert_eq!(report.status, HealthStatus::Warning);
        assert!(report.issues.iter().any(|i| i.contains("broken")));
        assert_eq!(report.limiter.max_concurrent, 2);
    }

    #[tokio::test]
    async fn test_shutdown_degrades_report() {
        let monitor = monitor();
        monitor.router().shutdown().await;
        let report = monitor.sample();
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_report_is_published() {
        let monitor = monitor();
        let mut rx = monitor.router().events().subscribe();
        monitor.sample();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "health:report");
        assert!(monitor.last_report.read().is_some());
    }
}
