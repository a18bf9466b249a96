// src/metrics/collector.rs
use crate::proxy::{ProxyEndpoint, ProxyStatus};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Dispatch metrics
    pub dispatch_attempts_total: IntCounterVec,
    pub dispatch_duration_seconds: HistogramVec,
    pub dispatch_failovers_total: IntCounter,
    pub transport_handles: IntGauge,

    // Allocation metrics
    pub allocations_total: IntCounterVec,

    // Health metrics
    pub probes_total: IntCounterVec,
    pub proxy_status: IntGaugeVec,
    pub released_bindings_total: IntCounter,

    // Pool metrics
    pub healthy_proxies: IntGauge,
    pub total_proxies: IntGauge,
    pub bound_tenants: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let dispatch_attempts_total = IntCounterVec::new(
            Opts::new("proxy_pool_dispatch_attempts_total", "Outbound attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(dispatch_attempts_total.clone()))?;

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "proxy_pool_dispatch_duration_seconds",
                "End-to-end dispatch duration including retries",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(dispatch_duration_seconds.clone()))?;

        let dispatch_failovers_total = IntCounter::new(
            "proxy_pool_dispatch_failovers_total",
            "Transport failures that triggered a failover",
        )?;
        registry.register(Box::new(dispatch_failovers_total.clone()))?;

        let transport_handles = IntGauge::new(
            "proxy_pool_transport_handles",
            "Cached transport handles",
        )?;
        registry.register(Box::new(transport_handles.clone()))?;

        let allocations_total = IntCounterVec::new(
            Opts::new("proxy_pool_allocations_total", "Lazy binding attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(allocations_total.clone()))?;

        let probes_total = IntCounterVec::new(
            Opts::new("proxy_pool_probes_total", "Health probes by result"),
            &["result"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let proxy_status = IntGaugeVec::new(
            Opts::new(
                "proxy_pool_proxy_status",
                "Proxy status (0=healthy, 1=suspect, 2=condemned)",
            ),
            &["proxy"],
        )?;
        registry.register(Box::new(proxy_status.clone()))?;

        let released_bindings_total = IntCounter::new(
            "proxy_pool_released_bindings_total",
            "Tenant bindings cleared by condemnation",
        )?;
        registry.register(Box::new(released_bindings_total.clone()))?;

        let healthy_proxies =
            IntGauge::new("proxy_pool_healthy_proxies", "Number of healthy proxies")?;
        registry.register(Box::new(healthy_proxies.clone()))?;

        let total_proxies =
            IntGauge::new("proxy_pool_total_proxies", "Number of known proxies")?;
        registry.register(Box::new(total_proxies.clone()))?;

        let bound_tenants =
            IntGauge::new("proxy_pool_bound_tenants", "Tenants currently bound to a proxy")?;
        registry.register(Box::new(bound_tenants.clone()))?;

        Ok(Self {
            dispatch_attempts_total,
            dispatch_duration_seconds,
            dispatch_failovers_total,
            transport_handles,
            allocations_total,
            probes_total,
            proxy_status,
            released_bindings_total,
            healthy_proxies,
            total_proxies,
            bound_tenants,
        })
    }

    pub fn record_attempt(&self, outcome: &str) {
        self.dispatch_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_dispatch(&self, success: bool, duration: std::time::Duration) {
        let outcome = if success { "response" } else { "error" };
        self.dispatch_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn record_failover(&self) {
        self.dispatch_failovers_total.inc();
    }

    pub fn update_transport_handles(&self, count: usize) {
        self.transport_handles.set(count as i64);
    }

    pub fn record_allocation(&self, result: &str) {
        self.allocations_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn record_probe(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.probes_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn update_proxy_status(&self, proxy: &str, status: ProxyStatus) {
        let value = match status {
            ProxyStatus::Healthy => 0,
            ProxyStatus::Suspect => 1,
            ProxyStatus::Condemned => 2,
        };

        self.proxy_status
            .with_label_values(&[proxy])
            .set(value);
    }

    pub fn record_released(&self, count: usize) {
        self.released_bindings_total.inc_by(count as u64);
    }

    pub fn update_pool(&self, endpoints: &[ProxyEndpoint]) {
        let healthy = endpoints
            .iter()
            .filter(|e| e.active && e.status == ProxyStatus::Healthy)
            .count();
        let bound: usize = endpoints.iter().map(|e| e.bound_tenants).sum();

        self.healthy_proxies.set(healthy as i64);
        self.total_proxies.set(endpoints.len() as i64);
        self.bound_tenants.set(bound as i64);
        for endpoint in endpoints {
            self.update_proxy_status(&endpoint.id.to_string(), endpoint.status);
        }
    }
}
