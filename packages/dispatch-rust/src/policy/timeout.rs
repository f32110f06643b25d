//! Timeout step.
//!
//! Downstream steps run with a child cancellation token. When the deadline passes first the
//! token is cancelled and [`HandlerError::Timeout`] is returned; the downstream work keeps
//! running until it observes the token. That work is handed to the pipeline's scope, which
//! holds back releasing handler instances until it stops.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use herald_core::Request;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use crate::error::HandlerError;
use crate::pipeline::{Envelope, Stragglers};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TimeoutLayer {
    duration: Duration,
    stragglers: Option<Stragglers>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            stragglers: None,
        }
    }

    /// Hands work still running after a timeout to `stragglers` instead of detaching it.
    pub(crate) fn reporting_to(mut self, stragglers: Stragglers) -> Self {
        self.stragglers = Some(stragglers);
        self
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            duration: self.duration,
            stragglers: self.stragglers.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TimeoutService<S> {
    inner: S,
    duration: Duration,
    stragglers: Option<Stragglers>,
}

impl<S, R> Service<Envelope<R>> for TimeoutService<S>
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

    fn call(&mut self, mut envelope: Envelope<R>) -> Self::Future {
        let inner = self.inner.clone();
        let duration = self.duration;
        let stragglers = self.stragglers.clone();
        let parent = envelope.context.cancellation.clone();
        let token = parent.child_token();
        envelope.context.cancellation = token.clone();

        Box::pin(async move {
            // Cancels downstream work if this future is dropped before it completes.
            let guard = token.clone().drop_guard();
            let mut work = tokio::spawn(inner.oneshot(envelope));

            let finished = tokio::select! {
                joined = &mut work => Some(joined),
                () = tokio::time::sleep(duration) => None,
            };

            let Some(joined) = finished else {
                token.cancel();
                warn!(
                    request_type = R::request_type(),
                    timeout_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "timed out, downstream cancelled"
                );
                if let Some(stragglers) = stragglers {
                    stragglers.push(Box::pin(async move {
                        let _ = work.await;
                    }));
                }
                return Err(HandlerError::timeout(duration));
            };

            let _ = guard.disarm();
            match joined {
                Ok(result) => result.map(|mut out| {
                    out.context.cancellation = parent;
                    out
                }),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(HandlerError::Cancelled),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use herald_core::{RequestContext, RequestId};

    use super::*;

    #[derive(Debug, Clone)]
    struct Report {
        id: RequestId,
    }

    impl Request for Report {
        fn id(&self) -> RequestId {
            self.id
        }
    }

    /// Sleeps for `delay`, watching the cancellation token.
    #[derive(Clone)]
    struct Slow {
        delay: Duration,
        observed_cancel: Arc<AtomicBool>,
    }

    impl Service<Envelope<Report>> for Slow {
        type Response = Envelope<Report>;
        type Error = HandlerError;
        type Future =
            Pin<Box<dyn Future<Output = Result<Envelope<Report>, HandlerError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, envelope: Envelope<Report>) -> Self::Future {
            let delay = self.delay;
            let observed = self.observed_cancel.clone();
            Box::pin(async move {
                let token = envelope.context.cancellation.clone();
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(envelope),
                    () = token.cancelled() => {
                        observed.store(true, Ordering::SeqCst);
                        Err(HandlerError::Cancelled)
                    }
                }
            })
        }
    }

    fn slow(delay_ms: u64) -> (Arc<AtomicBool>, Slow) {
        let observed = Arc::new(AtomicBool::new(false));
        (
            observed.clone(),
            Slow {
                delay: Duration::from_millis(delay_ms),
                observed_cancel: observed,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_deadline() {
        let (observed, svc) = slow(10);
        let stragglers = Stragglers::default();
        let ctx = RequestContext::new();
        let parent = ctx.cancellation.clone();
        let out = TimeoutLayer::new(Duration::from_millis(100))
            .reporting_to(stragglers.clone())
            .layer(svc)
            .oneshot(Envelope::new(Report { id: RequestId::new() }, ctx))
            .await
            .unwrap();
        assert!(!observed.load(Ordering::SeqCst));
        assert!(!out.context.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(stragglers.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_downstream_cooperatively() {
        let (observed, svc) = slow(1_000);
        let ctx = RequestContext::new();
        let parent = ctx.cancellation.clone();
        let err = TimeoutLayer::new(Duration::from_millis(50))
            .layer(svc)
            .oneshot(Envelope::new(Report { id: RequestId::new() }, ctx))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Timeout { after_ms: 50 }));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(observed.load(Ordering::SeqCst));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_work_is_handed_over_until_it_stops() {
        let (observed, svc) = slow(1_000);
        let stragglers = Stragglers::default();
        let err = TimeoutLayer::new(Duration::from_millis(50))
            .reporting_to(stragglers.clone())
            .layer(svc)
            .oneshot(Envelope::new(
                Report { id: RequestId::new() },
                RequestContext::new(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Timeout { .. }));

        let pending = stragglers.take();
        assert_eq!(pending.len(), 1);
        futures_util::future::join_all(pending).await;
        assert!(observed.load(Ordering::SeqCst));
    }
}
