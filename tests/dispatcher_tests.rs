// tests/dispatcher_tests.rs
use async_trait::async_trait;
use mockito::Matcher;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tenant_proxy_pool::allocation::SpareCapacityPolicy;
use tenant_proxy_pool::config::{DispatchConfig, ProviderConfig, ProxySeed, RetryConfig};
use tenant_proxy_pool::dispatch::{
    DispatchError, Dispatcher, MultipartForm, OutboundRequest, TransportCache, TransportSettings,
};
use tenant_proxy_pool::proxy::{
    CapacityClass, FailureReport, MemoryProxyStore, PoolProvider, ProviderError, ProxyEndpoint,
    ProxyId, ProxyProvider, ProxyScheme, ProxyStatus, ProxyStore, TenantId,
};
use tenant_proxy_pool::retry::RetryPolicy;
use url::Url;

/// Hands out endpoints in order, moving to the next one on each failure report.
struct ScriptedProvider {
    endpoints: Vec<ProxyEndpoint>,
    current: AtomicUsize,
    resolves: AtomicU32,
    reports: AtomicU32,
}

impl ScriptedProvider {
    fn new(endpoints: Vec<ProxyEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            current: AtomicUsize::new(0),
            resolves: AtomicU32::new(0),
            reports: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ProxyProvider for ScriptedProvider {
    async fn resolve_proxy(&self, _tenant: TenantId) -> Result<ProxyEndpoint, ProviderError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let index = self.current.load(Ordering::SeqCst).min(self.endpoints.len() - 1);
        Ok(self.endpoints[index].clone())
    }

    fn report_failure(&self, _tenant: TenantId) -> FailureReport {
        self.reports.fetch_add(1, Ordering::SeqCst);
        self.current.fetch_add(1, Ordering::SeqCst);
        FailureReport::settled()
    }
}

fn local_seed(id: u64, port: u16) -> ProxySeed {
    ProxySeed {
        id: ProxyId(id),
        scheme: ProxyScheme::Http,
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        region: None,
        capacity: CapacityClass::Shared,
        active: true,
    }
}

fn endpoints(ports: &[u16]) -> Vec<ProxyEndpoint> {
    let seeds: Vec<ProxySeed> = ports
        .iter()
        .enumerate()
        .map(|(i, port)| local_seed(i as u64 + 1, *port))
        .collect();
    MemoryProxyStore::from_seeds(5, &seeds).all()
}

/// A local port with nothing listening on it.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn dispatcher(provider: Arc<dyn ProxyProvider>, max_retries: u32) -> Dispatcher {
    let config = DispatchConfig {
        max_retries,
        request_timeout_secs: 5,
        connect_timeout_secs: 2,
        ..Default::default()
    };
    let retry = RetryPolicy::new(RetryConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 5,
    });
    let transports = Arc::new(TransportCache::new(TransportSettings::from(&config)));
    Dispatcher::new(provider, transports, &config, retry)
}

fn target(path: &str) -> Url {
    Url::parse(&format!("http://shop-api.test{}", path)).unwrap()
}

#[tokio::test]
async fn http_error_status_is_returned_without_retry() {
    let mut proxy = mockito::Server::new_async().await;
    let mock = proxy
        .mock("GET", Matcher::Any)
        .with_status(500)
        .with_body("upstream broke")
        .expect(1)
        .create_async()
        .await;

    let provider = ScriptedProvider::new(endpoints(&[proxy.socket_address().port()]));
    let dispatcher = dispatcher(provider.clone(), 2);

    let response = dispatcher
        .send(TenantId(7), OutboundRequest::get(target("/orders")))
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 500);
    assert_eq!(provider.resolves.load(Ordering::SeqCst), 1);
    assert_eq!(provider.reports.load(Ordering::SeqCst), 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn transport_failures_exhaust_budget() {
    let provider = ScriptedProvider::new(endpoints(&[dead_port()]));
    let dispatcher = dispatcher(provider.clone(), 2);

    let result = dispatcher
        .send(TenantId(7), OutboundRequest::get(target("/orders")))
        .await;

    match result {
        Err(DispatchError::Transport { attempts, proxy, .. }) => {
            assert_eq!(attempts, 3);
            assert_eq!(proxy, ProxyId(1));
        }
        other => panic!("expected transport failure, got {:?}", other.map(|r| r.status())),
    }
    assert_eq!(provider.resolves.load(Ordering::SeqCst), 3);
    // The final failure is not reported; the caller gets it instead.
    assert_eq!(provider.reports.load(Ordering::SeqCst), 2);
    assert!(dispatcher.transports().is_empty());
}

#[tokio::test]
async fn zero_budget_makes_a_single_attempt() {
    let provider = ScriptedProvider::new(endpoints(&[dead_port()]));
    let dispatcher = dispatcher(provider.clone(), 2);

    let result = dispatcher
        .send_with_budget(TenantId(7), OutboundRequest::get(target("/orders")), 0)
        .await;

    assert!(matches!(result, Err(DispatchError::Transport { attempts: 1, .. })));
    assert_eq!(provider.resolves.load(Ordering::SeqCst), 1);
    assert_eq!(provider.reports.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fails_over_to_next_proxy_after_report() {
    let mut good = mockito::Server::new_async().await;
    let mock = good
        .mock("GET", Matcher::Any)
        .with_status(200)
        .with_body("ok")
        .expect(1)
        .create_async()
        .await;

    let provider = ScriptedProvider::new(endpoints(&[dead_port(), good.socket_address().port()]));
    let dispatcher = dispatcher(provider.clone(), 2);

    let response = dispatcher
        .send(TenantId(7), OutboundRequest::get(target("/orders")))
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
    assert_eq!(provider.resolves.load(Ordering::SeqCst), 2);
    assert_eq!(provider.reports.load(Ordering::SeqCst), 1);
    // Only the working proxy's handle is left in the cache.
    assert_eq!(dispatcher.transports().len(), 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn pool_provider_moves_tenant_off_dead_proxy() {
    let mut good = mockito::Server::new_async().await;
    let mock = good
        .mock("GET", Matcher::Any)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryProxyStore::from_seeds(5, &[local_seed(1, dead_port())]));
    let provider = Arc::new(PoolProvider::new(
        store.clone(),
        Arc::new(SpareCapacityPolicy::new()),
        ProviderConfig::default(),
    ));
    assert_eq!(provider.resolve_proxy(TenantId(7)).await.unwrap().id, ProxyId(1));

    // A working proxy joins after the tenant was bound to the dead one.
    store.insert(&local_seed(2, good.socket_address().port()));
    let dispatcher = dispatcher(provider, 2);

    let response = dispatcher
        .send(TenantId(7), OutboundRequest::get(target("/orders")))
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let binding = store.binding(TenantId(7)).await.unwrap().unwrap();
    assert_eq!(binding.id, ProxyId(2));
    assert!(store.bound_tenants(ProxyId(1)).await.unwrap().is_empty());
    assert_eq!(store.get(ProxyId(1)).await.unwrap().unwrap().status, ProxyStatus::Suspect);
    mock.assert_async().await;
}

#[tokio::test]
async fn multipart_body_is_replayed_on_failover() {
    let mut good = mockito::Server::new_async().await;
    let mock = good
        .mock("POST", Matcher::Any)
        .match_header(
            "content-type",
            Matcher::Regex("^multipart/form-data; boundary=[0-9a-f-]+$".to_string()),
        )
        .match_body(Matcher::Regex(r#"name="invoice"; filename="inv-42.pdf""#.to_string()))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let provider = ScriptedProvider::new(endpoints(&[dead_port(), good.socket_address().port()]));
    let dispatcher = dispatcher(provider.clone(), 1);

    let form = MultipartForm::new()
        .text("customer", "acme")
        .file("invoice", "inv-42.pdf", "application/pdf", b"%PDF-1.4".to_vec());
    let response = dispatcher
        .send_multipart(TenantId(3), OutboundRequest::post(target("/uploads")), form)
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(provider.reports.load(Ordering::SeqCst), 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn provider_errors_are_not_retried() {
    struct EmptyPool;

    #[async_trait]
    impl ProxyProvider for EmptyPool {
        async fn resolve_proxy(&self, tenant: TenantId) -> Result<ProxyEndpoint, ProviderError> {
            Err(ProviderError::NotAvailable { tenant })
        }

        fn report_failure(&self, _tenant: TenantId) -> FailureReport {
            FailureReport::settled()
        }
    }

    let config = DispatchConfig::default();
    let dispatcher = Dispatcher::new(
        Arc::new(EmptyPool),
        Arc::new(TransportCache::new(TransportSettings::from(&config))),
        &config,
        RetryPolicy::new(RetryConfig::default()),
    );

    let result = dispatcher
        .send(TenantId(4), OutboundRequest::get(target("/orders")))
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::Provider(ProviderError::NotAvailable { tenant })) if tenant == TenantId(4)
    ));
}
