// src/health/monitor.rs
use super::probe::Prober;
use super::status::{CycleReport, ProbeResult};
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{ProxyEndpoint, ProxyId, ProxyQuery, ProxyStatus, ProxyStore, StoreError};
use crate::scheduler::PeriodicJob;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Failed to fetch probe candidates: {0}")]
    Candidates(#[source] StoreError),
}

/// Everything a spawned probe needs, cheap to clone into each task.
#[derive(Clone)]
struct ProbeRunner {
    store: Arc<dyn ProxyStore>,
    prober: Arc<dyn Prober>,
    metrics: Option<Arc<MetricsCollector>>,
    probe_timeout: Duration,
    condemn_after: u32,
}

impl ProbeRunner {
    async fn probe(&self, endpoint: ProxyEndpoint) -> ProbeResult {
        let start = std::time::Instant::now();

        let outcome = match timeout(self.probe_timeout, self.prober.probe(&endpoint)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("probe timed out".to_string()),
        };
        let response_time_ms = start.elapsed().as_millis() as u64;
        let healthy = outcome.is_ok();

        if let Some(metrics) = &self.metrics {
            metrics.record_probe(healthy);
        }

        let transition = match self.store.record_probe(endpoint.id, healthy, self.condemn_after).await {
            Ok(transition) => Some(transition),
            Err(e) => {
                warn!(proxy = %endpoint.id, "Failed to record probe outcome: {}", e);
                None
            }
        };

        if let Some(t) = &transition {
            if t.condemned() {
                warn!(
                    proxy = %t.proxy,
                    "Proxy {} condemned after {} consecutive failures, released {} tenants",
                    endpoint.address.authority(),
                    t.consecutive_failures,
                    t.released.len()
                );
            } else if t.from == ProxyStatus::Healthy && t.to == ProxyStatus::Suspect {
                warn!(proxy = %t.proxy, "Proxy {} is suspect", endpoint.address.authority());
            } else if t.from == ProxyStatus::Suspect && t.to == ProxyStatus::Healthy {
                info!(proxy = %t.proxy, "Proxy {} recovered", endpoint.address.authority());
            }

            if let Some(metrics) = &self.metrics {
                metrics.update_proxy_status(&t.proxy.to_string(), t.to);
                metrics.record_released(t.released.len());
            }
        }

        ProbeResult {
            proxy: endpoint.id,
            healthy,
            response_time_ms,
            error: outcome.err(),
            transition,
        }
    }
}

/// Clears the in-flight heal marker even when the heal is cancelled or panics.
struct HealingGuard<'a> {
    healing: &'a DashSet<ProxyId>,
    proxy: ProxyId,
}

impl Drop for HealingGuard<'_> {
    fn drop(&mut self) {
        self.healing.remove(&self.proxy);
    }
}

/// Probes the pool and moves endpoints through Healthy, Suspect and Condemned.
///
/// The monitor has no timer of its own: [`HealthMonitor::execute`] runs one
/// cycle and is driven by a [`crate::scheduler::Scheduler`] or called directly.
pub struct HealthMonitor {
    config: HealthCheckConfig,
    runner: ProbeRunner,
    healing: DashSet<ProxyId>,
    last_cycle: ArcSwapOption<CycleReport>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        store: Arc<dyn ProxyStore>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let runner = ProbeRunner {
            store,
            prober,
            metrics: None,
            probe_timeout: config.timeout(),
            condemn_after: config.condemn_after_failures,
        };

        Self {
            config,
            runner,
            healing: DashSet::new(),
            last_cycle: ArcSwapOption::empty(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.runner.metrics = Some(metrics);
        self
    }

    pub fn last_cycle(&self) -> Option<Arc<CycleReport>> {
        self.last_cycle.load_full()
    }

    /// Runs one probe cycle. No probe is launched once `deadline` has passed,
    /// but probes already launched are awaited before returning.
    pub async fn execute(&self, deadline: Instant) -> Result<CycleReport, HealthError> {
        let started = Instant::now();
        let candidates = match self.runner.store.find_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Health cycle aborted: {}", e);
                return Err(HealthError::Candidates(e));
            }
        };

        let mut report = CycleReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let stagger = self.config.stagger();
        let mut tasks = Vec::with_capacity(candidates.len());

        let mut pending = candidates.into_iter();
        while let Some(endpoint) = pending.next() {
            if Instant::now() >= deadline {
                report.skipped = 1 + pending.len();
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit,
                _ = sleep_until(deadline) => {
                    report.skipped = 1 + pending.len();
                    break;
                }
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(_) => {
                    report.skipped = 1 + pending.len();
                    break;
                }
            };

            let runner = self.runner.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                runner.probe(endpoint).await
            }));

            if !stagger.is_zero() && !pending.as_slice().is_empty() {
                sleep(stagger).await;
            }
        }

        // Let every launched probe finish its transition.
        let results = futures::future::join_all(tasks).await;

        for result in results {
            match result {
                Ok(probe) => {
                    if probe.healthy {
                        debug!("Proxy {} healthy in {}ms", probe.proxy, probe.response_time_ms);
                    } else {
                        debug!("Proxy {} probe failed: {:?}", probe.proxy, probe.error);
                    }
                    report.absorb(&probe);
                }
                Err(e) => {
                    error!("Probe task join error: {}", e);
                    report.probed += 1;
                    report.failed += 1;
                }
            }
        }

        report.duration = started.elapsed();
        if report.skipped > 0 {
            warn!(
                "Health cycle deadline reached, {} of {} proxies not probed",
                report.skipped, report.candidates
            );
        }
        info!(
            "Health cycle complete: {} probed, {} healthy, {} failed, {} condemned in {:?}",
            report.probed,
            report.healthy,
            report.failed,
            report.condemned.len(),
            report.duration
        );

        self.refresh_pool_metrics().await;
        self.last_cycle.store(Some(Arc::new(report.clone())));
        Ok(report)
    }

    /// Out-of-band probe after a live failure. Returns `None` when a heal probe
    /// for the same endpoint is already running.
    pub async fn heal(&self, endpoint: ProxyEndpoint) -> Option<ProbeResult> {
        let proxy = endpoint.id;
        if !self.healing.insert(proxy) {
            debug!(%proxy, "Heal probe already in flight");
            return None;
        }

        let _in_flight = HealingGuard {
            healing: &self.healing,
            proxy,
        };
        Some(self.runner.probe(endpoint).await)
    }

    async fn refresh_pool_metrics(&self) {
        let Some(metrics) = &self.runner.metrics else {
            return;
        };
        match self.runner.store.query(&ProxyQuery::default()).await {
            Ok(endpoints) => metrics.update_pool(&endpoints),
            Err(e) => debug!("Skipping pool metrics refresh: {}", e),
        }
    }
}

#[async_trait]
impl PeriodicJob for HealthMonitor {
    fn name(&self) -> &'static str {
        "health_monitor"
    }

    async fn run(&self, deadline: Instant) -> anyhow::Result<()> {
        self.execute(deadline).await?;
        Ok(())
    }
}
