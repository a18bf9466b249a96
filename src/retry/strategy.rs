// src/retry/strategy.rs

use crate::config::RetryConfig;
use crate::proxy::ProxyId;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Exponential backoff with up to 25% jitter, `attempt` starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base().as_millis() as u64;
        let max = self.config.backoff_max().as_millis() as u64;

        // Exponential backoff: base * 2^(attempt - 1)
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));

        // Cap at maximum
        let capped = exponential.min(max);

        // Add jitter (0-25% of the calculated backoff)
        let jitter = (capped as f64 * rand::random::<f64>() * 0.25) as u64;

        Duration::from_millis(capped + jitter)
    }
}

/// Which failures may fail over to another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connection refused, TLS failure, timeout, broken proxy tunnel.
    Transport,
    /// The request itself is malformed; another proxy would not help.
    Request,
}

/// HTTP statuses never reach this function: any response is a success for the
/// dispatcher, whatever its status code.
pub fn classify(error: &reqwest::Error) -> FailureClass {
    if error.is_builder() || error.is_redirect() {
        FailureClass::Request
    } else {
        FailureClass::Transport
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Try again; carries the number of the attempt that just failed.
    Retry(u32),
    Exhausted,
}

/// Attempt bookkeeping for one dispatch: counter, budget, last error and the
/// endpoint that produced it.
#[derive(Debug)]
pub struct FailoverState<E> {
    extra_attempts: u32,
    attempts: u32,
    last_error: Option<E>,
    proxy: Option<ProxyId>,
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub proxy: ProxyId,
    pub error: E,
}

impl<E> FailoverState<E> {
    pub fn new(extra_attempts: u32) -> Self {
        Self {
            extra_attempts,
            attempts: 0,
            last_error: None,
            proxy: None,
        }
    }

    /// Starts the next attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn record_transport_failure(&mut self, proxy: ProxyId, error: E) -> Verdict {
        self.proxy = Some(proxy);
        self.last_error = Some(error);

        if self.attempts <= self.extra_attempts {
            Verdict::Retry(self.attempts)
        } else {
            Verdict::Exhausted
        }
    }

    /// `None` until at least one transport failure has been recorded.
    pub fn into_exhausted(self) -> Option<Exhausted<E>> {
        match (self.last_error, self.proxy) {
            (Some(error), Some(proxy)) => Some(Exhausted {
                attempts: self.attempts,
                proxy,
                error,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            backoff_base_ms: base,
            backoff_max_ms: max,
        })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = policy(10, 100);

        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(13));

        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(50));

        let tenth = policy.backoff(10);
        assert!(tenth >= Duration::from_millis(100) && tenth <= Duration::from_millis(125));
    }

    #[test]
    fn zero_base_means_no_wait() {
        assert_eq!(policy(0, 0).backoff(4), Duration::ZERO);
    }

    #[test]
    fn budget_of_two_extra_allows_three_attempts() {
        let mut state: FailoverState<&str> = FailoverState::new(2);

        state.begin_attempt();
        assert_eq!(state.record_transport_failure(ProxyId(1), "refused"), Verdict::Retry(1));
        state.begin_attempt();
        assert_eq!(state.record_transport_failure(ProxyId(2), "refused"), Verdict::Retry(2));
        state.begin_attempt();
        assert_eq!(state.record_transport_failure(ProxyId(2), "timeout"), Verdict::Exhausted);

        let exhausted = state.into_exhausted().unwrap();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.proxy, ProxyId(2));
        assert_eq!(exhausted.error, "timeout");
    }

    #[test]
    fn zero_budget_exhausts_on_first_failure() {
        let mut state: FailoverState<()> = FailoverState::new(0);
        state.begin_attempt();
        assert_eq!(state.record_transport_failure(ProxyId(1), ()), Verdict::Exhausted);
    }
}
