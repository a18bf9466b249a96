// src/allocation/mod.rs
mod policy;
mod spare_capacity;

pub use policy::{AllocationPolicy, AllocationRequest}; // trait
pub use spare_capacity::SpareCapacityPolicy;
pub use crate::config::AllocationStrategy;

use std::sync::Arc;

pub fn create_policy(strategy: AllocationStrategy) -> Arc<dyn AllocationPolicy> {
    match strategy {
        AllocationStrategy::SpareCapacity => Arc::new(SpareCapacityPolicy::new()),
    }
}
