//! Once-only gate backed by an [`Inbox`].
//!
//! A request is recorded under its context key after the rest of the chain succeeds.
//! Failed attempts are not recorded, so redeliveries get another try.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use herald_core::Request;
use tower::{Layer, Service};
use tracing::warn;

use crate::error::HandlerError;
use crate::inbox::{InboxRecord, OnceOnlyAction};
use crate::pipeline::Envelope;
use crate::traits::Inbox;

// ---------------------------------------------------------------------------
// InboxLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InboxLayer {
    inbox: Arc<dyn Inbox>,
    context_key: Arc<str>,
    once_only: bool,
    action: OnceOnlyAction,
}

impl InboxLayer {
    pub fn new(
        inbox: Arc<dyn Inbox>,
        context_key: impl Into<Arc<str>>,
        once_only: bool,
        action: OnceOnlyAction,
    ) -> Self {
        Self {
            inbox,
            context_key: context_key.into(),
            once_only,
            action,
        }
    }
}

impl<S> Layer<S> for InboxLayer {
    type Service = InboxService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InboxService {
            inner,
            layer: self.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// InboxService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InboxService<S> {
    inner: S,
    layer: InboxLayer,
}

impl<S, R> Service<Envelope<R>> for InboxService<S>
where
    S: Service<Envelope<R>, Response = Envelope<R>, Error = HandlerError> + Clone + Send + 'static,
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
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let InboxLayer {
            inbox,
            context_key,
            once_only,
            action,
        } = self.layer.clone();

        Box::pin(async move {
            let request_id = envelope.request.id();
            if once_only && inbox.exists(request_id, &context_key).await? {
                match action {
                    OnceOnlyAction::Warn => {
                        warn!(
                            request_type = R::request_type(),
                            %request_id,
                            context_key = %context_key,
                            "request already handled, skipping"
                        );
                        return Ok(envelope);
                    }
                    OnceOnlyAction::Throw => {
                        return Err(HandlerError::DuplicateRequest {
                            request_id,
                            context_key: context_key.to_string(),
                        });
                    }
                }
            }

            let envelope = inner.call(envelope).await?;
            inbox
                .add(InboxRecord::new(
                    request_id,
                    context_key.as_ref(),
                    R::request_type(),
                ))
                .await?;
            Ok(envelope)
        })
    }
}
