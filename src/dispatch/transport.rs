// src/dispatch/transport.rs
use crate::config::{DispatchConfig, HealthCheckConfig};
use crate::proxy::{ProxyEndpoint, ProxyId};
use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Proxy {proxy} has an invalid address: {source}")]
    InvalidAddress {
        proxy: ProxyId,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to build transport for proxy {proxy}: {source}")]
    Build {
        proxy: ProxyId,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub user_agent: Option<String>,
}

impl From<&DispatchConfig> for TransportSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            pool_idle_timeout: config.pool_idle_timeout(),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl From<&HealthCheckConfig> for TransportSettings {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            connect_timeout: config.timeout(),
            pool_idle_timeout: config.interval(),
            pool_max_idle_per_host: 1,
            user_agent: None,
        }
    }
}

/// Connection pool routed through exactly one proxy endpoint.
#[derive(Debug)]
pub struct TransportHandle {
    signature: String,
    proxy: ProxyId,
    client: Client,
    created_at: Instant,
}

impl TransportHandle {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn proxy(&self) -> ProxyId {
        self.proxy
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Handles keyed by endpoint signature. Creation happens under the key's entry,
/// so a signature never has two live handles built for it concurrently.
pub struct TransportCache {
    handles: DashMap<String, Arc<TransportHandle>>,
    settings: TransportSettings,
}

impl TransportCache {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            handles: DashMap::new(),
            settings,
        }
    }

    pub fn get_or_create(&self, endpoint: &ProxyEndpoint) -> Result<Arc<TransportHandle>, TransportError> {
        let signature = endpoint.signature();
        if let Some(handle) = self.handles.get(&signature) {
            return Ok(handle.value().clone());
        }

        let handle = self
            .handles
            .entry(signature)
            .or_try_insert_with(|| self.build(endpoint).map(Arc::new))?;
        Ok(handle.value().clone())
    }

    /// Removes `handle` if it is still the cached one. A newer handle for the
    /// same signature is left alone. Callers holding the old handle keep using
    /// it until they drop it.
    pub fn evict(&self, handle: &Arc<TransportHandle>) -> bool {
        let evicted = self
            .handles
            .remove_if(&handle.signature, |_, cached| Arc::ptr_eq(cached, handle))
            .is_some();

        if evicted {
            tracing::debug!(
                proxy = %handle.proxy,
                "Evicted transport handle after {:?}",
                handle.age()
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn build(&self, endpoint: &ProxyEndpoint) -> Result<TransportHandle, TransportError> {
        let proxy_url = endpoint
            .address
            .to_url()
            .map_err(|source| TransportError::InvalidAddress {
                proxy: endpoint.id,
                source,
            })?;
        let build_error = |source| TransportError::Build {
            proxy: endpoint.id,
            source,
        };

        let proxy = reqwest::Proxy::all(proxy_url).map_err(build_error)?;
        let mut builder = Client::builder()
            .proxy(proxy)
            .connect_timeout(self.settings.connect_timeout)
            .pool_idle_timeout(self.settings.pool_idle_timeout)
            .pool_max_idle_per_host(self.settings.pool_max_idle_per_host);
        if let Some(user_agent) = &self.settings.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let client = builder.build().map_err(build_error)?;

        tracing::debug!(
            proxy = %endpoint.id,
            "Created transport handle via {}",
            endpoint.address.authority()
        );

        Ok(TransportHandle {
            signature: endpoint.signature(),
            proxy: endpoint.id,
            client,
            created_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{CapacityClass, Credentials, ProxyAddress, ProxyScheme, ProxyStatus};

    fn endpoint(id: u64, password: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            id: ProxyId(id),
            address: ProxyAddress {
                scheme: ProxyScheme::Http,
                host: "127.0.0.1".into(),
                port: 3128,
                credentials: Some(Credentials {
                    username: "shop".into(),
                    password: password.into(),
                }),
            },
            region: None,
            capacity: CapacityClass::Shared,
            capacity_limit: 2,
            status: ProxyStatus::Healthy,
            consecutive_failures: 0,
            active: true,
            bound_tenants: 0,
            last_assigned_at: None,
            last_probed_at: None,
        }
    }

    fn cache() -> TransportCache {
        TransportCache::new(TransportSettings::from(&DispatchConfig::default()))
    }

    #[tokio::test]
    async fn same_signature_reuses_handle() {
        let cache = cache();
        let a = cache.get_or_create(&endpoint(1, "pw")).unwrap();
        let b = cache.get_or_create(&endpoint(1, "pw")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(a.proxy(), ProxyId(1));
        assert_eq!(a.signature(), "http://shop:pw@127.0.0.1:3128");
    }

    #[tokio::test]
    async fn credentials_are_part_of_the_key() {
        let cache = cache();
        let a = cache.get_or_create(&endpoint(1, "old")).unwrap();
        let b = cache.get_or_create(&endpoint(1, "new")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn stale_eviction_keeps_newer_handle() {
        let cache = cache();
        let old = cache.get_or_create(&endpoint(1, "pw")).unwrap();
        assert!(cache.evict(&old));

        let fresh = cache.get_or_create(&endpoint(1, "pw")).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!cache.evict(&old));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_one_handle() {
        let cache = Arc::new(cache());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.get_or_create(&endpoint(1, "pw")).unwrap() }));
        }

        let handles: Vec<Arc<TransportHandle>> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }
}
