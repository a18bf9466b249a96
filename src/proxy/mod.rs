//
// src/proxy/mod.rs
//
mod endpoint;
mod provider;
mod store;

pub use endpoint::{
    CapacityClass, Credentials, ProxyAddress, ProxyEndpoint, ProxyId, ProxyScheme, ProxyStatus,
    TenantId,
};
pub use provider::{FailureReport, PoolProvider, ProviderError, ProxyProvider};
pub use store::{BindOutcome, MemoryProxyStore, ProbeTransition, ProxyQuery, ProxyStore, StoreError};
