// ────────────────────────────────
// src/proxy/provider.rs
// Resolves tenants to proxy endpoints, binding lazily on first use
// ────────────────────────────────

use super::endpoint::{ProxyEndpoint, ProxyStatus, TenantId};
use super::store::{BindOutcome, ProxyQuery, ProxyStore, StoreError};
use crate::allocation::{AllocationPolicy, AllocationRequest};
use crate::config::ProviderConfig;
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("No proxy with spare capacity available for tenant {tenant}")]
    NotAvailable { tenant: TenantId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capability the dispatcher consumes.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    async fn resolve_proxy(&self, tenant: TenantId) -> Result<ProxyEndpoint, ProviderError>;

    /// Must return immediately; handling happens in the background.
    fn report_failure(&self, tenant: TenantId) -> FailureReport;
}

/// Handle returned by [`ProxyProvider::report_failure`].
///
/// [`FailureReport::unbound`] resolves once the tenant no longer points at the
/// failing endpoint, so the next resolve can pick another one. Probing the
/// endpoint carries on in the background either way.
#[derive(Debug)]
pub struct FailureReport {
    unbound: Option<oneshot::Receiver<()>>,
}

impl FailureReport {
    /// A report with nothing left to wait for.
    pub fn settled() -> Self {
        Self { unbound: None }
    }

    fn pending() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { unbound: Some(rx) })
    }

    pub async fn unbound(self) {
        if let Some(rx) = self.unbound {
            // A dropped sender means the background task ended early; nothing to wait for.
            let _ = rx.await;
        }
    }
}

pub struct PoolProvider {
    store: Arc<dyn ProxyStore>,
    policy: Arc<dyn AllocationPolicy>,
    defaults: ProviderConfig,
    healer: Option<Arc<HealthMonitor>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PoolProvider {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        policy: Arc<dyn AllocationPolicy>,
        defaults: ProviderConfig,
    ) -> Self {
        Self {
            store,
            policy,
            defaults,
            healer: None,
            metrics: None,
        }
    }

    /// Failure reports trigger an out-of-band probe through this monitor.
    pub fn with_healer(mut self, healer: Arc<HealthMonitor>) -> Self {
        self.healer = Some(healer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn resolve_proxy_for(
        &self,
        request: AllocationRequest,
    ) -> Result<ProxyEndpoint, ProviderError> {
        let tenant = request.tenant;
        if tenant.is_sentinel() {
            return self.any_healthy().await;
        }

        if let Some(endpoint) = self.store.binding(tenant).await? {
            return Ok(endpoint);
        }

        let query = ProxyQuery {
            capacity: request.capacity,
            ..ProxyQuery::allocatable()
        };
        let candidates = self.store.query(&query).await?;
        let ranked = self.policy.rank(&request, &candidates);

        for proxy in ranked {
            match self.store.try_bind(tenant, proxy).await? {
                BindOutcome::Bound(endpoint) => {
                    info!(
                        %tenant,
                        proxy = %endpoint.id,
                        "Bound tenant to {} ({}/{} slots used)",
                        endpoint.address.authority(),
                        endpoint.bound_tenants,
                        endpoint.capacity_limit
                    );
                    self.record_allocation("bound");
                    return Ok(endpoint);
                }
                BindOutcome::AlreadyBound(endpoint) => {
                    self.record_allocation("already_bound");
                    return Ok(endpoint);
                }
                BindOutcome::Rejected => {
                    debug!(%tenant, %proxy, "Proxy filled up before bind, trying next candidate");
                }
            }
        }

        warn!(
            %tenant,
            candidates = candidates.len(),
            policy = self.policy.name(),
            "No proxy available for tenant"
        );
        self.record_allocation("unavailable");
        Err(ProviderError::NotAvailable { tenant })
    }

    async fn any_healthy(&self) -> Result<ProxyEndpoint, ProviderError> {
        let query = ProxyQuery {
            status: Some(ProxyStatus::Healthy),
            active_only: true,
            ..Default::default()
        };
        let healthy = self.store.query(&query).await?;

        healthy
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ProviderError::NotAvailable {
                tenant: TenantId::SENTINEL,
            })
    }

    fn request_for(&self, tenant: TenantId) -> AllocationRequest {
        AllocationRequest {
            tenant,
            region: self.defaults.default_region.clone(),
            capacity: self.defaults.capacity_class,
        }
    }

    fn record_allocation(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_allocation(result);
        }
    }
}

#[async_trait]
impl ProxyProvider for PoolProvider {
    async fn resolve_proxy(&self, tenant: TenantId) -> Result<ProxyEndpoint, ProviderError> {
        self.resolve_proxy_for(self.request_for(tenant)).await
    }

    fn report_failure(&self, tenant: TenantId) -> FailureReport {
        if tenant.is_sentinel() {
            return FailureReport::settled();
        }

        let store = self.store.clone();
        let healer = self.healer.clone();
        let (unbound, report) = FailureReport::pending();

        tokio::spawn(async move {
            let endpoint = match store.binding(tenant).await {
                Ok(Some(endpoint)) => endpoint,
                Ok(None) => {
                    debug!(%tenant, "Failure reported for unbound tenant");
                    return;
                }
                Err(e) => {
                    warn!(%tenant, "Could not look up binding for failure report: {}", e);
                    return;
                }
            };

            match store.release_from(tenant, endpoint.id).await {
                Ok(true) => info!(
                    %tenant,
                    proxy = %endpoint.id,
                    "Released tenant from {} after live failure",
                    endpoint.address.authority()
                ),
                Ok(false) => debug!(%tenant, proxy = %endpoint.id, "Tenant already moved off proxy"),
                Err(e) => warn!(%tenant, proxy = %endpoint.id, "Failed to release tenant: {}", e),
            }

            match store.mark_suspect(endpoint.id).await {
                Ok(ProxyStatus::Suspect) if endpoint.status == ProxyStatus::Healthy => {
                    warn!(%tenant, proxy = %endpoint.id, "Proxy marked suspect after live failure");
                }
                Ok(_) => {}
                Err(e) => warn!(proxy = %endpoint.id, "Failed to mark proxy suspect: {}", e),
            }
            // Released and demoted, so the retry may resolve now.
            let _ = unbound.send(());

            if let Some(healer) = healer {
                healer.heal(endpoint).await;
            }
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::SpareCapacityPolicy;
    use crate::config::ProxySeed;
    use crate::proxy::{CapacityClass, MemoryProxyStore, ProxyId, ProxyScheme};

    fn seed(id: u64, region: Option<&str>) -> ProxySeed {
        ProxySeed {
            id: ProxyId(id),
            scheme: ProxyScheme::Http,
            host: format!("10.0.1.{}", id),
            port: 8000,
            username: None,
            password: None,
            region: region.map(str::to_string),
            capacity: CapacityClass::Shared,
            active: true,
        }
    }

    fn provider(store: Arc<MemoryProxyStore>, defaults: ProviderConfig) -> PoolProvider {
        PoolProvider::new(store, Arc::new(SpareCapacityPolicy::new()), defaults)
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let store = Arc::new(MemoryProxyStore::from_seeds(3, &[seed(1, None), seed(2, None)]));
        let provider = provider(store.clone(), ProviderConfig::default());

        let first = provider.resolve_proxy(TenantId(9)).await.unwrap();
        for _ in 0..5 {
            assert_eq!(provider.resolve_proxy(TenantId(9)).await.unwrap().id, first.id);
        }
        assert_eq!(store.bound_tenants(first.id).await.unwrap(), vec![TenantId(9)]);
    }

    #[tokio::test]
    async fn new_tenants_spread_by_spare_capacity() {
        let store = Arc::new(MemoryProxyStore::from_seeds(3, &[seed(1, None), seed(2, None)]));
        let provider = provider(store, ProviderConfig::default());

        let a = provider.resolve_proxy(TenantId(1)).await.unwrap();
        let b = provider.resolve_proxy(TenantId(2)).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn default_region_is_preferred() {
        let store = Arc::new(MemoryProxyStore::from_seeds(
            3,
            &[seed(1, Some("us")), seed(2, Some("jp"))],
        ));
        let defaults = ProviderConfig {
            default_region: Some("jp".into()),
            ..Default::default()
        };
        let provider = provider(store, defaults);

        assert_eq!(provider.resolve_proxy(TenantId(1)).await.unwrap().id, ProxyId(2));
    }

    #[tokio::test]
    async fn sentinel_never_binds() {
        let store = Arc::new(MemoryProxyStore::from_seeds(1, &[seed(1, None)]));
        let provider = provider(store.clone(), ProviderConfig::default());

        let endpoint = provider.resolve_proxy(TenantId::SENTINEL).await.unwrap();
        assert_eq!(endpoint.id, ProxyId(1));
        assert!(store.bound_tenants(ProxyId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_pool_is_not_available() {
        let store = Arc::new(MemoryProxyStore::new(1));
        let provider = provider(store, ProviderConfig::default());

        assert!(matches!(
            provider.resolve_proxy(TenantId(3)).await,
            Err(ProviderError::NotAvailable { tenant }) if tenant == TenantId(3)
        ));
    }
}
