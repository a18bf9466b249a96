// src/lib.rs
pub mod config;
pub mod proxy;
pub mod allocation;
pub mod dispatch;
pub mod retry;
pub mod health;
pub mod scheduler;
pub mod metrics;
