// src/allocation/spare_capacity.rs
use crate::allocation::{AllocationPolicy, AllocationRequest};
use crate::proxy::{ProxyEndpoint, ProxyId};
use std::cmp::{Ordering, Reverse};

/// Most spare capacity first, region matches ahead of everything else, then the
/// endpoint that was assigned least recently.
pub struct SpareCapacityPolicy;

impl SpareCapacityPolicy {
    pub fn new() -> Self {
        Self
    }

    fn eligible(request: &AllocationRequest, endpoint: &ProxyEndpoint) -> bool {
        if !endpoint.is_allocatable() {
            return false;
        }
        match request.capacity {
            Some(capacity) => endpoint.capacity == capacity,
            None => true,
        }
    }

    fn compare(request: &AllocationRequest, a: &ProxyEndpoint, b: &ProxyEndpoint) -> Ordering {
        let region_miss = |e: &ProxyEndpoint| match &request.region {
            Some(region) => e.region.as_deref() != Some(region.as_str()),
            None => false,
        };

        region_miss(a)
            .cmp(&region_miss(b))
            .then_with(|| Reverse(a.spare_capacity()).cmp(&Reverse(b.spare_capacity())))
            // None (never assigned) sorts before any timestamp
            .then_with(|| a.last_assigned_at.cmp(&b.last_assigned_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

impl Default for SpareCapacityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationPolicy for SpareCapacityPolicy {
    fn rank(&self, request: &AllocationRequest, candidates: &[ProxyEndpoint]) -> Vec<ProxyId> {
        let mut eligible: Vec<&ProxyEndpoint> = candidates
            .iter()
            .filter(|e| Self::eligible(request, e))
            .collect();

        eligible.sort_by(|a, b| Self::compare(request, a, b));
        eligible.into_iter().map(|e| e.id).collect()
    }

    fn name(&self) -> &'static str {
        "spare_capacity"
    }
}
