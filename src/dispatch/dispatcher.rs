// src/dispatch/dispatcher.rs
use super::multipart::MultipartForm;
use super::request::OutboundRequest;
use super::transport::{TransportCache, TransportError};
use crate::config::DispatchConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{ProviderError, ProxyId, ProxyProvider, TenantId};
use crate::retry::{classify, FailoverState, FailureClass, RetryPolicy, Verdict};
use reqwest::Response;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Transport failed after {attempts} attempts (last proxy {proxy}): {source}")]
    Transport {
        attempts: u32,
        proxy: ProxyId,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid outbound request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Handle(#[from] TransportError),
}

/// Sends tenant requests through the tenant's proxy, failing over on
/// transport errors. Any HTTP response, whatever its status, is returned as-is.
pub struct Dispatcher {
    provider: Arc<dyn ProxyProvider>,
    transports: Arc<TransportCache>,
    retry: RetryPolicy,
    max_retries: u32,
    request_timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn ProxyProvider>,
        transports: Arc<TransportCache>,
        config: &DispatchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            transports,
            retry,
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transports(&self) -> &Arc<TransportCache> {
        &self.transports
    }

    pub async fn send(&self, tenant: TenantId, request: OutboundRequest) -> Result<Response, DispatchError> {
        self.send_with_budget(tenant, request, self.max_retries).await
    }

    /// `extra_attempts` retries after the first attempt.
    pub async fn send_with_budget(
        &self,
        tenant: TenantId,
        request: OutboundRequest,
        extra_attempts: u32,
    ) -> Result<Response, DispatchError> {
        let started = Instant::now();
        let span = tracing::debug_span!(
            "dispatch",
            request_id = %uuid::Uuid::new_v4(),
            %tenant,
            method = %request.method
        );

        let result = self.run(tenant, &request, extra_attempts).instrument(span).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(result.is_ok(), started.elapsed());
            metrics.update_transport_handles(self.transports.len());
        }
        result
    }

    /// Sends `form` as the `multipart/form-data` body of `request` with the
    /// same failover behaviour as [`Dispatcher::send`].
    pub async fn send_multipart(
        &self,
        tenant: TenantId,
        request: OutboundRequest,
        form: MultipartForm,
    ) -> Result<Response, DispatchError> {
        self.send(tenant, request.multipart(form)).await
    }

    async fn run(
        &self,
        tenant: TenantId,
        request: &OutboundRequest,
        extra_attempts: u32,
    ) -> Result<Response, DispatchError> {
        let mut state = FailoverState::new(extra_attempts);

        loop {
            let attempt = state.begin_attempt();
            let endpoint = self.provider.resolve_proxy(tenant).await?;
            let handle = self.transports.get_or_create(&endpoint)?;

            debug!(attempt, proxy = %endpoint.id, "Sending to {}", request.url);

            let builder = request
                .build(handle.client(), self.request_timeout)
                .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;

            let error = match builder.send().await {
                Ok(response) => {
                    self.record_attempt("response");
                    debug!(attempt, status = %response.status(), "Received response");
                    return Ok(response);
                }
                Err(error) => error,
            };

            if classify(&error) == FailureClass::Request {
                self.record_attempt("invalid_request");
                return Err(DispatchError::InvalidRequest(error.to_string()));
            }

            self.record_attempt("transport_error");
            self.transports.evict(&handle);

            match state.record_transport_failure(endpoint.id, error) {
                Verdict::Retry(failed) => {
                    warn!(
                        attempt = failed,
                        proxy = %endpoint.id,
                        "Transport failure via {}, failing over",
                        endpoint.address.authority()
                    );
                    let report = self.provider.report_failure(tenant);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_failover();
                    }
                    // Re-resolve only once the tenant is off the failed endpoint.
                    tokio::join!(tokio::time::sleep(self.retry.backoff(failed)), report.unbound());
                }
                Verdict::Exhausted => break,
            }
        }

        match state.into_exhausted() {
            Some(exhausted) => {
                warn!(
                    attempts = exhausted.attempts,
                    proxy = %exhausted.proxy,
                    "Giving up: {}",
                    exhausted.error
                );
                Err(DispatchError::Transport {
                    attempts: exhausted.attempts,
                    proxy: exhausted.proxy,
                    source: exhausted.error,
                })
            }
            // The loop only breaks after recording a failure.
            None => Err(DispatchError::InvalidRequest("no attempt was made".to_string())),
        }
    }

    fn record_attempt(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(outcome);
        }
    }
}
