//
// src/proxy/store.rs
//

use super::endpoint::{CapacityClass, ProxyAddress, ProxyEndpoint, ProxyId, ProxyStatus, TenantId};
use crate::config::ProxySeed;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown proxy {0}")]
    UnknownProxy(ProxyId),

    #[error("Proxy store unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// The tenant is now bound to the requested endpoint.
    Bound(ProxyEndpoint),
    /// A concurrent caller bound the tenant first; this is its endpoint.
    AlreadyBound(ProxyEndpoint),
    /// The endpoint is full, not healthy, or inactive.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ProbeTransition {
    pub proxy: ProxyId,
    pub from: ProxyStatus,
    pub to: ProxyStatus,
    pub consecutive_failures: u32,
    /// Tenants whose binding was cleared because the endpoint was condemned.
    pub released: Vec<TenantId>,
}

impl ProbeTransition {
    pub fn condemned(&self) -> bool {
        self.from != ProxyStatus::Condemned && self.to == ProxyStatus::Condemned
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProxyQuery {
    pub status: Option<ProxyStatus>,
    pub capacity: Option<CapacityClass>,
    pub region: Option<String>,
    pub active_only: bool,
    pub with_spare_capacity: bool,
}

impl ProxyQuery {
    /// Endpoints a new tenant could be bound to right now.
    pub fn allocatable() -> Self {
        Self {
            status: Some(ProxyStatus::Healthy),
            active_only: true,
            with_spare_capacity: true,
            ..Default::default()
        }
    }

    fn matches(&self, endpoint: &ProxyEndpoint) -> bool {
        if let Some(status) = self.status {
            if endpoint.status != status {
                return false;
            }
        }
        if let Some(capacity) = self.capacity {
            if endpoint.capacity != capacity {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if endpoint.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        if self.active_only && !endpoint.active {
            return false;
        }
        if self.with_spare_capacity && endpoint.spare_capacity() == 0 {
            return false;
        }
        true
    }
}

/// Persistence boundary for endpoints and tenant bindings.
///
/// Every mutating method is a single atomic step: implementations must never
/// expose a state where a tenant set exceeds its capacity limit or where a
/// condemned endpoint still carries bindings.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// All active, non-condemned endpoints.
    async fn find_candidates(&self) -> Result<Vec<ProxyEndpoint>, StoreError>;

    async fn query(&self, query: &ProxyQuery) -> Result<Vec<ProxyEndpoint>, StoreError>;

    async fn get(&self, proxy: ProxyId) -> Result<Option<ProxyEndpoint>, StoreError>;

    async fn binding(&self, tenant: TenantId) -> Result<Option<ProxyEndpoint>, StoreError>;

    /// Allocate-if-capacity-available.
    async fn try_bind(&self, tenant: TenantId, proxy: ProxyId) -> Result<BindOutcome, StoreError>;

    async fn release(&self, tenant: TenantId) -> Result<Option<ProxyId>, StoreError>;

    /// Releases the tenant only while it is still bound to `proxy`.
    async fn release_from(&self, tenant: TenantId, proxy: ProxyId) -> Result<bool, StoreError>;

    /// Applies a probe outcome; condemnation clears bindings in the same step.
    async fn record_probe(
        &self,
        proxy: ProxyId,
        success: bool,
        condemn_after: u32,
    ) -> Result<ProbeTransition, StoreError>;

    /// Demotes a healthy endpoint after a live failure. The streak is untouched.
    async fn mark_suspect(&self, proxy: ProxyId) -> Result<ProxyStatus, StoreError>;

    async fn clear_bindings(&self, proxy: ProxyId) -> Result<Vec<TenantId>, StoreError>;

    /// Deactivating releases every tenant bound to the endpoint.
    async fn set_active(&self, proxy: ProxyId, active: bool) -> Result<Vec<TenantId>, StoreError>;

    /// Manual return of a condemned endpoint to `Healthy`.
    async fn reinstate(&self, proxy: ProxyId) -> Result<(), StoreError>;

    async fn bound_tenants(&self, proxy: ProxyId) -> Result<Vec<TenantId>, StoreError>;
}

#[derive(Debug)]
struct Slot {
    status: ProxyStatus,
    consecutive_failures: u32,
    active: bool,
    tenants: HashSet<TenantId>,
    last_assigned_at: Option<DateTime<Utc>>,
    last_probed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct EndpointRecord {
    id: ProxyId,
    address: ProxyAddress,
    region: Option<String>,
    capacity: CapacityClass,
    limit: usize,
    slot: Mutex<Slot>,
}

impl EndpointRecord {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot still holds consistent data: every mutation completes
        // before anything that could panic.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, slot: &Slot) -> ProxyEndpoint {
        ProxyEndpoint {
            id: self.id,
            address: self.address.clone(),
            region: self.region.clone(),
            capacity: self.capacity,
            capacity_limit: self.limit,
            status: slot.status,
            consecutive_failures: slot.consecutive_failures,
            active: slot.active,
            bound_tenants: slot.tenants.len(),
            last_assigned_at: slot.last_assigned_at,
            last_probed_at: slot.last_probed_at,
        }
    }

    fn admit(&self, slot: &mut Slot, tenant: TenantId) -> bool {
        if !slot.active || slot.status != ProxyStatus::Healthy || slot.tenants.len() >= self.limit {
            return false;
        }
        slot.tenants.insert(tenant);
        slot.last_assigned_at = Some(Utc::now());
        true
    }
}

/// In-process store. Each endpoint's tenant set lives behind its own mutex, so
/// allocations only contend when they target the same endpoint.
///
/// Lock order is binding index shard, then endpoint slot. Paths that start from
/// an endpoint release its slot before touching the index.
#[derive(Clone)]
pub struct MemoryProxyStore {
    endpoints: Arc<DashMap<ProxyId, Arc<EndpointRecord>>>,
    bindings: Arc<DashMap<TenantId, ProxyId>>,
    shared_capacity: usize,
}

impl MemoryProxyStore {
    pub fn new(shared_capacity: usize) -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            bindings: Arc::new(DashMap::new()),
            shared_capacity,
        }
    }

    pub fn from_seeds(shared_capacity: usize, seeds: &[ProxySeed]) -> Self {
        let store = Self::new(shared_capacity);
        for seed in seeds {
            store.insert(seed);
        }
        store
    }

    /// Adds or replaces an endpoint definition. Replacing drops its bindings.
    pub fn insert(&self, seed: &ProxySeed) {
        let record = Arc::new(EndpointRecord {
            id: seed.id,
            address: seed.address(),
            region: seed.region.clone(),
            capacity: seed.capacity,
            limit: seed.capacity.limit(self.shared_capacity),
            slot: Mutex::new(Slot {
                status: ProxyStatus::Healthy,
                consecutive_failures: 0,
                active: seed.active,
                tenants: HashSet::new(),
                last_assigned_at: None,
                last_probed_at: None,
            }),
        });

        if let Some(previous) = self.endpoints.insert(seed.id, record) {
            let released: Vec<TenantId> = previous.lock().tenants.drain().collect();
            self.prune_index(seed.id, &released);
        }

        tracing::info!(
            "Registered proxy {} ({}, {})",
            seed.id,
            seed.address().authority(),
            seed.capacity.as_str()
        );
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn all(&self) -> Vec<ProxyEndpoint> {
        let mut all: Vec<ProxyEndpoint> = self
            .records()
            .into_iter()
            .map(|record| {
                let slot = record.lock();
                record.snapshot(&slot)
            })
            .collect();
        all.sort_by_key(|e| e.id);
        all
    }

    fn record(&self, proxy: ProxyId) -> Option<Arc<EndpointRecord>> {
        self.endpoints.get(&proxy).map(|r| r.value().clone())
    }

    fn records(&self) -> Vec<Arc<EndpointRecord>> {
        self.endpoints.iter().map(|entry| entry.value().clone()).collect()
    }

    fn prune_index(&self, proxy: ProxyId, tenants: &[TenantId]) {
        let record = self.record(proxy);
        for tenant in tenants {
            self.forget_stale(*tenant, proxy, record.as_deref());
        }
    }

    /// Drops the index entry for `tenant` if it points at `proxy` and the
    /// endpoint no longer lists the tenant. The slot is checked while the index
    /// entry is held, so a tenant re-admitted in the meantime keeps its entry.
    fn forget_stale(&self, tenant: TenantId, proxy: ProxyId, record: Option<&EndpointRecord>) {
        self.bindings.remove_if(&tenant, |_, bound| {
            *bound == proxy && record.map_or(true, |r| !r.lock().tenants.contains(&tenant))
        });
    }

    fn drain(&self, record: &EndpointRecord) -> Vec<TenantId> {
        let released: Vec<TenantId> = record.lock().tenants.drain().collect();
        self.prune_index(record.id, &released);
        released
    }

    /// The tenant's endpoint, if the endpoint still lists the tenant.
    fn validated(&self, tenant: TenantId, proxy: ProxyId) -> Option<ProxyEndpoint> {
        let record = self.record(proxy)?;
        let slot = record.lock();
        if slot.tenants.contains(&tenant) {
            Some(record.snapshot(&slot))
        } else {
            None
        }
    }
}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn find_candidates(&self) -> Result<Vec<ProxyEndpoint>, StoreError> {
        Ok(self
            .all()
            .into_iter()
            .filter(|e| e.active && e.status != ProxyStatus::Condemned)
            .collect())
    }

    async fn query(&self, query: &ProxyQuery) -> Result<Vec<ProxyEndpoint>, StoreError> {
        Ok(self.all().into_iter().filter(|e| query.matches(e)).collect())
    }

    async fn get(&self, proxy: ProxyId) -> Result<Option<ProxyEndpoint>, StoreError> {
        Ok(self.record(proxy).map(|record| {
            let slot = record.lock();
            record.snapshot(&slot)
        }))
    }

    async fn binding(&self, tenant: TenantId) -> Result<Option<ProxyEndpoint>, StoreError> {
        let proxy = match self.bindings.get(&tenant) {
            Some(entry) => *entry.value(),
            None => return Ok(None),
        };

        match self.validated(tenant, proxy) {
            Some(endpoint) => Ok(Some(endpoint)),
            None => {
                // The endpoint already dropped this tenant; forget the stale index entry.
                self.forget_stale(tenant, proxy, self.record(proxy).as_deref());
                Ok(None)
            }
        }
    }

    async fn try_bind(&self, tenant: TenantId, proxy: ProxyId) -> Result<BindOutcome, StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;

        match self.bindings.entry(tenant) {
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if let Some(existing) = self.validated(tenant, current) {
                    return Ok(BindOutcome::AlreadyBound(existing));
                }

                let mut slot = record.lock();
                if !record.admit(&mut slot, tenant) {
                    return Ok(BindOutcome::Rejected);
                }
                occupied.insert(proxy);
                Ok(BindOutcome::Bound(record.snapshot(&slot)))
            }
            Entry::Vacant(vacant) => {
                let mut slot = record.lock();
                if !record.admit(&mut slot, tenant) {
                    return Ok(BindOutcome::Rejected);
                }
                vacant.insert(proxy);
                Ok(BindOutcome::Bound(record.snapshot(&slot)))
            }
        }
    }

    async fn release(&self, tenant: TenantId) -> Result<Option<ProxyId>, StoreError> {
        let Entry::Occupied(occupied) = self.bindings.entry(tenant) else {
            return Ok(None);
        };
        let proxy = occupied.remove();
        let released = match self.record(proxy) {
            Some(record) => record.lock().tenants.remove(&tenant),
            None => false,
        };
        Ok(released.then_some(proxy))
    }

    async fn release_from(&self, tenant: TenantId, proxy: ProxyId) -> Result<bool, StoreError> {
        let Entry::Occupied(occupied) = self.bindings.entry(tenant) else {
            return Ok(false);
        };
        if *occupied.get() != proxy {
            return Ok(false);
        }
        occupied.remove();
        Ok(match self.record(proxy) {
            Some(record) => record.lock().tenants.remove(&tenant),
            None => false,
        })
    }

    async fn record_probe(
        &self,
        proxy: ProxyId,
        success: bool,
        condemn_after: u32,
    ) -> Result<ProbeTransition, StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;

        let mut slot = record.lock();
        let from = slot.status;
        let (to, streak) = from.after_probe(slot.consecutive_failures, success, condemn_after);
        slot.status = to;
        slot.consecutive_failures = streak;
        slot.last_probed_at = Some(Utc::now());

        let released: Vec<TenantId> = if from != ProxyStatus::Condemned && to == ProxyStatus::Condemned {
            slot.tenants.drain().collect()
        } else {
            Vec::new()
        };
        drop(slot);

        self.prune_index(proxy, &released);

        Ok(ProbeTransition {
            proxy,
            from,
            to,
            consecutive_failures: streak,
            released,
        })
    }

    async fn mark_suspect(&self, proxy: ProxyId) -> Result<ProxyStatus, StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;
        let mut slot = record.lock();
        if slot.status == ProxyStatus::Healthy {
            slot.status = ProxyStatus::Suspect;
        }
        Ok(slot.status)
    }

    async fn clear_bindings(&self, proxy: ProxyId) -> Result<Vec<TenantId>, StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;
        Ok(self.drain(&record))
    }

    async fn set_active(&self, proxy: ProxyId, active: bool) -> Result<Vec<TenantId>, StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;
        let released: Vec<TenantId> = {
            let mut slot = record.lock();
            slot.active = active;
            if active {
                Vec::new()
            } else {
                slot.tenants.drain().collect()
            }
        };
        self.prune_index(proxy, &released);
        Ok(released)
    }

    async fn reinstate(&self, proxy: ProxyId) -> Result<(), StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;
        let mut slot = record.lock();
        slot.status = ProxyStatus::Healthy;
        slot.consecutive_failures = 0;
        tracing::info!("Proxy {} reinstated", proxy);
        Ok(())
    }

    async fn bound_tenants(&self, proxy: ProxyId) -> Result<Vec<TenantId>, StoreError> {
        let record = self.record(proxy).ok_or(StoreError::UnknownProxy(proxy))?;
        let mut tenants: Vec<TenantId> = record.lock().tenants.iter().copied().collect();
        tenants.sort();
        Ok(tenants)
    }
}
