//! Circuit breaker policy.
//!
//! After `failure_threshold` consecutive transient failures the circuit opens and calls fail
//! with [`HandlerError::BrokenCircuit`] without reaching downstream steps. Once
//! `break_duration` has elapsed a trial call is let through: success closes the circuit,
//! failure re-opens it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use herald_core::Request;
use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use crate::error::HandlerError;
use crate::pipeline::Envelope;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Break duration elapsed; the next call is a trial.
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Breaker settings plus the state shared by every clone.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: u32,
    pub break_duration: Duration,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreakerPolicy {
    #[must_use]
    pub fn new(failure_threshold: u32, break_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            break_duration,
            state: Arc::new(Mutex::new(BreakerState::default())),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        match state.open_until {
            None => CircuitState::Closed,
            Some(until) if Instant::now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    fn permits_call(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Returns `true` if this failure opened the circuit.
    pub(crate) fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let trial_failed = state.open_until.is_some();
        if trial_failed || state.consecutive_failures >= self.failure_threshold {
            state.open_until = Some(Instant::now() + self.break_duration);
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerLayer / CircuitBreakerService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    name: Arc<str>,
    policy: CircuitBreakerPolicy,
}

impl CircuitBreakerLayer {
    #[must_use]
    pub fn new(name: &str, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            name: Arc::clone(&self.name),
            policy: self.policy.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    name: Arc<str>,
    policy: CircuitBreakerPolicy,
}

impl<S, R> Service<Envelope<R>> for CircuitBreakerService<S>
where
    S: Service<Envelope<R>, Response = Envelope<R>, Error = HandlerError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    R: Request,
{
    type Response = Envelope<R>;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope<R>, HandlerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope<R>) -> Self::Future {
        let inner = self.inner.clone();
        let name = Arc::clone(&self.name);
        let policy = self.policy.clone();

        Box::pin(async move {
            if !policy.permits_call() {
                return Err(HandlerError::BrokenCircuit {
                    policy: name.to_string(),
                });
            }
            match inner.oneshot(envelope).await {
                Ok(out) => {
                    policy.record_success();
                    Ok(out)
                }
                Err(e) => {
                    if e.is_transient() && policy.record_failure() {
                        warn!(
                            policy = %name,
                            break_ms = u64::try_from(policy.break_duration.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "circuit opened"
                        );
                    }
                    Err(e)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
