// src/health/probe.rs
use crate::dispatch::{TransportCache, TransportError};
use crate::proxy::ProxyEndpoint;
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error(transparent)]
    Handle(#[from] TransportError),
}

/// One lightweight request through an endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<(), ProbeError>;
}

/// Fetches `probe_url` through the endpoint with its credentials.
pub struct ReqwestProber {
    transports: Arc<TransportCache>,
    url: Url,
}

impl ReqwestProber {
    pub fn new(transports: Arc<TransportCache>, url: Url) -> Self {
        Self { transports, url }
    }
}

#[async_trait]
impl Prober for ReqwestProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<(), ProbeError> {
        let handle = self.transports.get_or_create(endpoint)?;

        let response = match handle.client().get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(proxy = %handle.proxy(), "Probe transport failed, evicting handle: {}", e);
                self.transports.evict(&handle);
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status))
        }
    }
}
