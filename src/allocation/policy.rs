// src/allocation/policy.rs
use crate::proxy::{CapacityClass, ProxyEndpoint, ProxyId, TenantId};

/// What a tenant asks for when it has no binding yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub tenant: TenantId,
    pub region: Option<String>,
    pub capacity: Option<CapacityClass>,
}

impl AllocationRequest {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            region: None,
            capacity: None,
        }
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_capacity(mut self, capacity: CapacityClass) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Pure ranking of allocation candidates.
///
/// Implementations only order snapshots; the store decides atomically whether
/// a bind still fits, so a stale snapshot costs one rejected attempt.
pub trait AllocationPolicy: Send + Sync {
    fn rank(&self, request: &AllocationRequest, candidates: &[ProxyEndpoint]) -> Vec<ProxyId>;

    fn name(&self) -> &'static str;
}
