//! Terminal steps: the business handler and the no-op end of the chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use herald_core::Request;
use tower::{Service, ServiceExt};

use crate::error::HandlerError;
use crate::pipeline::{Envelope, Handler, StepService};

/// Runs the business handler, then the after-steps in `next`.
pub struct HandlerService<R: Request> {
    handler: Arc<dyn Handler<R>>,
    next: StepService<R>,
}

impl<R: Request> HandlerService<R> {
    pub fn new(handler: Arc<dyn Handler<R>>, next: StepService<R>) -> Self {
        Self { handler, next }
    }
}

impl<R: Request> Clone for HandlerService<R> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            next: self.next.clone(),
        }
    }
}

impl<R: Request> Service<Envelope<R>> for HandlerService<R> {
    type Response = Envelope<R>;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Envelope<R>, HandlerError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut envelope: Envelope<R>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let next = self.next.clone();
        Box::pin(async move {
            if envelope.context.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            handler
                .handle(&mut envelope.request, &envelope.context)
                .await?;
            next.oneshot(envelope).await
        })
    }
}

/// End of every chain; returns the envelope unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminus;

impl<R: Request> Service<Envelope<R>> for Terminus {
    type Response = Envelope<R>;
    type Error = HandlerError;
    type Future = std::future::Ready<Result<Envelope<R>, HandlerError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope<R>) -> Self::Future {
        std::future::ready(Ok(envelope))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use herald_core::{RequestContext, RequestId};
    use tower::util::BoxCloneService;

    use super::*;

    #[derive(Debug, Clone)]
    struct Counter {
        id: RequestId,
        value: u32,
    }

    impl Request for Counter {
        fn id(&self) -> RequestId {
            self.id
        }
    }

    struct Increment;

    #[async_trait]
    impl Handler<Counter> for Increment {
        async fn handle(&self, r: &mut Counter, _ctx: &RequestContext) -> Result<(), HandlerError> {
            r.value += 1;
            Ok(())
        }
    }

    fn envelope() -> Envelope<Counter> {
        Envelope::new(
            Counter {
                id: RequestId::new(),
                value: 0,
            },
            RequestContext::new(),
        )
    }

    #[tokio::test]
    async fn handler_mutates_request_then_forwards() {
        let svc = HandlerService::new(Arc::new(Increment), BoxCloneService::new(Terminus));
        let out = svc.oneshot(envelope()).await.unwrap();
        assert_eq!(out.request.value, 1);
    }

    #[tokio::test]
    async fn cancelled_context_skips_handler() {
        let svc = HandlerService::new(Arc::new(Increment), BoxCloneService::new(Terminus));
        let env = envelope();
        env.context.cancellation.cancel();
        let err = svc.oneshot(env).await.unwrap_err();
        assert!(matches!(err, HandlerError::Cancelled));
    }
}
