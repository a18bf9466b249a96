// src/retry/mod.rs
mod strategy;

pub use strategy::{classify, Exhausted, FailoverState, FailureClass, RetryPolicy, Verdict};
