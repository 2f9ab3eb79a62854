//! Circuit breaking and retry for upstream calls.
//!
//! The two wrappers compose breaker-outer / retrier-inner: the breaker
//! observes only the final outcome of a retry chain, so retry bursts cannot
//! drive a degraded upstream further into failure once the breaker has
//! opened. [`ResilienceChain`] is the tagged composition built from
//! configuration.
use std::{
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{
    config::models::ResilienceConfig,
    core::error::GatewayError,
};

/// Breaker state. Only one state is active at a time; transitions are
/// serialized behind the breaker's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Rolling counters, reset on every state transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct BreakerCounts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl BreakerCounts {
    fn on_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

struct BreakerInner {
    state: BreakerState,
    counts: BreakerCounts,
    opened_at: Option<Instant>,
}

/// Failure gate wrapping upstream calls.
///
/// Closed: calls pass through and failures are counted; the breaker trips to
/// Open once at least `failure_threshold` requests were observed and at
/// least half of them failed. Open: calls are refused with
/// [`GatewayError::CircuitOpen`] until `reset_timeout` elapses, then the
/// breaker probes in HalfOpen. HalfOpen: at most `failure_threshold` probe
/// calls are admitted; a single failure re-opens, `failure_threshold`
/// consecutive successes close.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                counts: BreakerCounts::default(),
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock() {
            Ok(inner) => inner.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    /// Execute `f` under the breaker. When the breaker is open the thunk is
    /// not invoked at all.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.before_call()?;
        let result = f().await;
        self.after_call(result.is_ok());
        result
    }

    fn before_call(&self) -> Result<(), GatewayError> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        match inner.state {
            BreakerState::Closed => {
                inner.counts.requests += 1;
                Ok(())
            }
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if !expired {
                    return Err(GatewayError::CircuitOpen);
                }
                Self::transition(&mut inner, BreakerState::HalfOpen);
                inner.counts.requests += 1;
                Ok(())
            }
            BreakerState::HalfOpen => {
                // Probe budget: no more than failure_threshold in-flight
                // admissions per half-open generation.
                if inner.counts.requests >= self.failure_threshold {
                    return Err(GatewayError::CircuitOpen);
                }
                inner.counts.requests += 1;
                Ok(())
            }
        }
    }

    fn after_call(&self, success: bool) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };

        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.failure_threshold
            {
                Self::transition(&mut inner, BreakerState::Closed);
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                BreakerState::Closed => {
                    let counts = inner.counts;
                    let ratio = f64::from(counts.failures) / f64::from(counts.requests.max(1));
                    if counts.requests >= self.failure_threshold && ratio >= 0.5 {
                        Self::transition(&mut inner, BreakerState::Open);
                    }
                }
                BreakerState::HalfOpen => {
                    Self::transition(&mut inner, BreakerState::Open);
                }
                BreakerState::Open => {}
            }
        }
    }

    fn transition(inner: &mut BreakerInner, to: BreakerState) {
        tracing::info!(from = %inner.state, to = %to, "circuit breaker state changed");
        inner.state = to;
        inner.counts = BreakerCounts::default();
        inner.opened_at = match to {
            BreakerState::Open => Some(Instant::now()),
            _ => None,
        };
    }
}

/// Bounded exponential-backoff executor.
///
/// Runs the thunk up to `max_retries` times, starting at `initial_interval`
/// and doubling per attempt, with no jitter. Errors are not classified: any
/// error is retried and the last one is returned verbatim.
pub struct Retrier {
    max_retries: u32,
    initial_interval: Duration,
}

impl Retrier {
    pub fn new(max_retries: u32, initial_interval: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            initial_interval,
        }
    }

    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut delay = self.initial_interval;
        let mut last_err = None;

        for attempt in 1..=self.max_retries {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "retry attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        tracing::debug!(max_retries = self.max_retries, "all retry attempts failed");
        Err(last_err
            .unwrap_or_else(|| GatewayError::Internal("retrier exhausted without attempts".into())))
    }
}

/// Tagged composition of the resilience wrappers around a forward attempt.
pub enum ResilienceChain {
    /// No wrapping; the thunk runs exactly once.
    Direct,
    Retry(Retrier),
    Breaker(CircuitBreaker),
    /// Breaker-outer, retrier-inner: the breaker sees one outcome per retry
    /// chain.
    BreakerOverRetry(CircuitBreaker, Retrier),
}

impl ResilienceChain {
    pub fn from_config(cfg: &ResilienceConfig) -> Self {
        let breaker = cfg
            .enable_circuit_breaker
            .then(|| CircuitBreaker::new(cfg.failure_threshold, cfg.reset_timeout()));
        let retrier = cfg
            .enable_retry
            .then(|| Retrier::new(cfg.max_retries, cfg.retry_interval()));

        match (breaker, retrier) {
            (Some(b), Some(r)) => ResilienceChain::BreakerOverRetry(b, r),
            (Some(b), None) => ResilienceChain::Breaker(b),
            (None, Some(r)) => ResilienceChain::Retry(r),
            (None, None) => ResilienceChain::Direct,
        }
    }

    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match self {
            ResilienceChain::Direct => f().await,
            ResilienceChain::Retry(retrier) => retrier.execute(f).await,
            ResilienceChain::Breaker(breaker) => breaker.execute(f).await,
            ResilienceChain::BreakerOverRetry(breaker, retrier) => {
                breaker.execute(|| retrier.execute(f)).await
            }
        }
    }
}
