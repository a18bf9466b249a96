// src/health/mod.rs
mod monitor;
mod probe;
mod status;

pub use monitor::{HealthError, HealthMonitor};
pub use probe::{ProbeError, Prober, ReqwestProber};
pub use status::{CycleReport, ProbeResult};
