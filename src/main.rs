// src/main.rs
use anyhow::{Context, Result};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tenant_proxy_pool::{
    allocation::create_policy,
    config,
    dispatch::{Dispatcher, OutboundRequest, TransportCache, TransportSettings},
    health::{HealthMonitor, ReqwestProber},
    metrics::MetricsRegistry,
    proxy::{MemoryProxyStore, PoolProvider, TenantId},
    retry::RetryPolicy,
    scheduler::Scheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenant_proxy_pool=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    // Proxy pool
    let store = Arc::new(MemoryProxyStore::from_seeds(
        config.pool.shared_capacity,
        &config.proxies,
    ));
    info!("Loaded {} proxies", store.len());

    // Health monitor with its own transport cache so probes never evict dispatch handles
    let probe_url = url::Url::parse(&config.health.probe_url).context("Invalid probe URL")?;
    let probe_transports = Arc::new(TransportCache::new(TransportSettings::from(&config.health)));
    let prober = Arc::new(ReqwestProber::new(probe_transports, probe_url.clone()));
    let monitor = Arc::new(
        HealthMonitor::new(config.health.clone(), store.clone(), prober)
            .with_metrics(metrics.clone()),
    );

    // Provider and dispatcher
    let provider = Arc::new(
        PoolProvider::new(
            store.clone(),
            create_policy(config.provider.strategy),
            config.provider.clone(),
        )
        .with_healer(monitor.clone())
        .with_metrics(metrics.clone()),
    );
    let transports = Arc::new(TransportCache::new(TransportSettings::from(&config.dispatch)));
    let dispatcher = Dispatcher::new(
        provider,
        transports,
        &config.dispatch,
        RetryPolicy::new(config.retry.clone()),
    )
    .with_metrics(metrics.clone());

    // Start health monitor
    let scheduler = Scheduler::new().register(
        monitor.clone(),
        config.health.interval(),
        config.health.cycle_deadline(),
    );
    let jobs = scheduler.start();

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    // Unauthenticated liveness call through any healthy proxy
    match dispatcher
        .send(TenantId::SENTINEL, OutboundRequest::get(probe_url))
        .await
    {
        Ok(response) => info!("Egress check returned {}", response.status()),
        Err(e) => warn!("Egress check failed: {}", e),
    }

    shutdown_signal().await;

    scheduler.shutdown();
    futures::future::join_all(jobs).await;
    info!("Proxy pool stopped");

    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path); // keep this for logging
    let service_path = metrics_path.clone(); // clone for the service closure

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    let mut response = if req.uri().path() == path.as_str() {
                        let mut response = Response::new(Body::from(registry.gather()));
                        response.headers_mut().insert(
                            hyper::header::CONTENT_TYPE,
                            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        response
                    } else {
                        Response::new(Body::from("Not Found"))
                    };
                    if req.uri().path() != path.as_str() {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                    }
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .context("Failed to bind metrics server")?
        .serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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

    info!("Shutdown signal received");
}
