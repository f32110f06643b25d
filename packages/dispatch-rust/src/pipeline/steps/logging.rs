//! Request logging step.
//!
//! Logs the request type and id on entry and the outcome with elapsed time on exit.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use herald_core::Request;
use tower::{Layer, Service};
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::pipeline::{Envelope, Timing};

// ---------------------------------------------------------------------------
// RequestLoggingLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RequestLoggingLayer {
    timing: Timing,
}

impl RequestLoggingLayer {
    #[must_use]
    pub fn new(timing: Timing) -> Self {
        Self { timing }
    }
}

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingService {
            inner,
            timing: self.timing,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestLoggingService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestLoggingService<S> {
    inner: S,
    timing: Timing,
}

impl<S, R> Service<Envelope<R>> for RequestLoggingService<S>
where
    S: Service<Envelope<R>, Response = Envelope<R>, Error = HandlerError> + Send,
    S::Future: Send + 'static,
    R: Request,
{
    type Response = Envelope<R>;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope<R>, HandlerError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, envelope: Envelope<R>) -> Self::Future {
        let request_type = R::request_type();
        let request_id = envelope.request.id();
        let timing = self.timing.as_str();
        info!(request_type, %request_id, timing, "handling request");

        let fut = self.inner.call(envelope);
        Box::pin(async move {
            let start = Instant::now();
            let result = fut.await;
            #[allow(clippy::cast_possible_truncation)]
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => info!(request_type, %request_id, timing, elapsed_ms, "handled request"),
                Err(e) => warn!(request_type, %request_id, timing, elapsed_ms, error = %e, "request failed"),
            }
            result
        })
    }
}
