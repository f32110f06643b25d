//! Retry policy: re-invokes the wrapped chain on transient failures.
//!
//! Makes `1 + backoffs.len()` attempts. When every attempt fails the last failure is
//! surfaced inside [`HandlerError::RetryExhausted`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use herald_core::Request;
use rand::Rng;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use crate::error::HandlerError;
use crate::pipeline::Envelope;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before each retry, in order.
    pub backoffs: Vec<Duration>,
    /// Upper bound of random extra wait added to each backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(backoffs: Vec<Duration>) -> Self {
        Self {
            backoffs,
            jitter: Duration::ZERO,
        }
    }

    /// `retries` retries with the same wait between each.
    #[must_use]
    pub fn constant(retries: usize, wait: Duration) -> Self {
        Self::new(vec![wait; retries])
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.backoffs.len() + 1
    }

    fn delay(&self, retry: usize) -> Duration {
        let base = self.backoffs.get(retry).copied().unwrap_or_default();
        if self.jitter.is_zero() {
            return base;
        }
        let max = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        base + Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

// ---------------------------------------------------------------------------
// RetryLayer / RetryService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryLayer {
    name: Arc<str>,
    policy: Arc<RetryPolicy>,
}

impl RetryLayer {
    #[must_use]
    pub fn new(name: &str, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            name: Arc::clone(&self.name),
            policy: Arc::clone(&self.policy),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    name: Arc<str>,
    policy: Arc<RetryPolicy>,
}

impl<S, R> Service<Envelope<R>> for RetryService<S>
where
    S: Service<Envelope<R>, Response = Envelope<R>, Error = HandlerError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    R: Request,
{
    type Response = Envelope<R>;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope<R>, HandlerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each attempt drives its own clone to readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope<R>) -> Self::Future {
        let inner = self.inner.clone();
        let name = Arc::clone(&self.name);
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            let attempts = policy.max_attempts();
            let mut attempt = 0;
            loop {
                attempt += 1;
                let error = match inner.clone().oneshot(envelope.clone()).await {
                    Ok(out) => return Ok(out),
                    Err(e) if !e.is_transient() => return Err(e),
                    Err(e) => e,
                };
                if attempt >= attempts || envelope.context.is_cancelled() {
                    return Err(HandlerError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                let delay = policy.delay(attempt - 1);
                warn!(
                    policy = %name,
                    request_type = R::request_type(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
