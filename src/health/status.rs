// src/health/status.rs
use crate::proxy::{ProbeTransition, ProxyId};
use std::time::Duration;

#[derive(Debug)]
pub struct ProbeResult {
    pub proxy: ProxyId,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
    /// `None` when the store could not record the outcome.
    pub transition: Option<ProbeTransition>,
}

/// Summary of one monitor cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub candidates: usize,
    pub probed: usize,
    pub healthy: usize,
    pub failed: usize,
    pub condemned: Vec<ProxyId>,
    pub released_tenants: usize,
    /// Candidates not probed because the deadline passed first.
    pub skipped: usize,
    pub duration: Duration,
}

impl CycleReport {
    pub(crate) fn absorb(&mut self, result: &ProbeResult) {
        self.probed += 1;
        if result.healthy {
            self.healthy += 1;
        } else {
            self.failed += 1;
        }

        if let Some(transition) = &result.transition {
            if transition.condemned() {
                self.condemned.push(transition.proxy);
            }
            self.released_tenants += transition.released.len();
        }
    }
}
