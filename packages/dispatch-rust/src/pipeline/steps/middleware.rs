use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use herald_core::Request;
use tower::{Layer, Service};

use crate::error::HandlerError;
use crate::pipeline::{Envelope, Middleware, Next, StepService};

/// Adapts a user [`Middleware`] into a pipeline step.
pub struct MiddlewareLayer<R: Request> {
    middleware: Arc<dyn Middleware<R>>,
}

impl<R: Request> MiddlewareLayer<R> {
    pub fn new(middleware: Arc<dyn Middleware<R>>) -> Self {
        Self { middleware }
    }
}

impl<R: Request> Layer<StepService<R>> for MiddlewareLayer<R> {
    type Service = MiddlewareService<R>;

    fn layer(&self, inner: StepService<R>) -> Self::Service {
        MiddlewareService {
            middleware: Arc::clone(&self.middleware),
            inner,
        }
    }
}

pub struct MiddlewareService<R: Request> {
    middleware: Arc<dyn Middleware<R>>,
    inner: StepService<R>,
}

impl<R: Request> Clone for MiddlewareService<R> {
    fn clone(&self) -> Self {
        Self {
            middleware: Arc::clone(&self.middleware),
            inner: self.inner.clone(),
        }
    }
}

impl<R: Request> Service<Envelope<R>> for MiddlewareService<R> {
    type Response = Envelope<R>;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope<R>, HandlerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope<R>) -> Self::Future {
        let middleware = Arc::clone(&self.middleware);
        let next = Next::new(self.inner.clone());
        Box::pin(async move { middleware.handle(envelope, next).await })
    }
}
