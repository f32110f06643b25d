//! Command processor: the single entry point for dispatching requests.
//!
//! In-process dispatch (`send`, `publish`) builds fresh pipelines per call. Cross-process
//! dispatch (`post`, `deposit_post`, `clear_outbox`) maps requests to wire messages and moves
//! them through the outbox. `call` and `reply` implement request/reply over a transport.

mod builder;
mod call;
mod mappers;

use std::sync::Arc;

use herald_core::{MessageId, Request, RequestContext};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::ProcessorConfig;
use crate::error::{ConfigurationError, HandlerError};
use crate::outbox::{OutboxRelay, OutboxTransaction};
use crate::pipeline::{Envelope, Pipeline, PipelineBuilder, SubscriberRegistry};
use crate::policy::PolicyRegistry;
use crate::traits::{ChannelFactory, Inbox};
use crate::transport::ProducerRegistry;

pub use builder::CommandProcessorBuilder;
pub use mappers::MessageMapperRegistry;

/// Routes requests to handler pipelines and to the outbox.
///
/// Stateless across calls and safe to share between performer loops.
pub struct CommandProcessor {
    subscribers: Arc<SubscriberRegistry>,
    policies: Arc<PolicyRegistry>,
    mappers: Arc<MessageMapperRegistry>,
    producers: Arc<ProducerRegistry>,
    relay: Arc<OutboxRelay>,
    inbox: Option<Arc<dyn Inbox>>,
    reply_channels: Option<Arc<dyn ChannelFactory>>,
    config: ProcessorConfig,
}

impl CommandProcessor {
    #[must_use]
    pub fn builder() -> CommandProcessorBuilder {
        CommandProcessorBuilder::new()
    }

    #[must_use]
    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    #[must_use]
    pub fn mappers(&self) -> &Arc<MessageMapperRegistry> {
        &self.mappers
    }

    #[must_use]
    pub fn producers(&self) -> &Arc<ProducerRegistry> {
        &self.producers
    }

    /// Relay shared with any sweeper watching the same outbox.
    #[must_use]
    pub fn relay(&self) -> &Arc<OutboxRelay> {
        &self.relay
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn pipelines<R: Request>(&self) -> Result<Vec<Pipeline<R>>, HandlerError> {
        PipelineBuilder::new(&self.subscribers, &self.policies)
            .with_inbox(self.inbox.as_ref())
            .with_global_inbox(self.config.inbox.as_ref())
            .build::<R>()
    }

    // -----------------------------------------------------------------------
    // In-process dispatch
    // -----------------------------------------------------------------------

    /// Dispatches a command to its single handler and returns the request as the pipeline
    /// left it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless exactly one handler is registered, otherwise the
    /// first error raised by the pipeline.
    pub async fn send<R: Request>(&self, request: R) -> Result<R, HandlerError> {
        self.send_with_context(request, RequestContext::new()).await
    }

    /// [`send`](Self::send) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_with_context<R: Request>(
        &self,
        request: R,
        ctx: RequestContext,
    ) -> Result<R, HandlerError> {
        let span = info_span!(
            "dispatch",
            mode = "send",
            request_type = R::request_type(),
            request_id = %request.id(),
        );
        self.run_single(request, ctx).instrument(span).await
    }

    async fn run_single<R: Request>(&self, request: R, ctx: RequestContext) -> Result<R, HandlerError> {
        match self.subscribers.handlers_for::<R>().len() {
            0 => {
                return Err(ConfigurationError::NoHandler {
                    request_type: R::request_type(),
                }
                .into())
            }
            1 => {}
            count => {
                return Err(ConfigurationError::MultipleHandlers {
                    request_type: R::request_type(),
                    count,
                }
                .into())
            }
        }
        let Some(pipeline) = self.pipelines::<R>()?.pop() else {
            return Err(ConfigurationError::NoHandler {
                request_type: R::request_type(),
            }
            .into());
        };
        debug!(pipeline = pipeline.description(), "sending");
        let out = pipeline.run(Envelope::new(request, ctx)).await?;
        Ok(out.request)
    }

    /// Runs every handler registered for `event`, each in its own pipeline.
    ///
    /// Handlers run one after another with their own copy of the event and context; a
    /// failure in one does not stop the rest. Zero handlers is not an error.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a pipeline cannot be built, or
    /// [`HandlerError::Aggregate`] holding every handler failure once all have run.
    pub async fn publish<R: Request>(&self, event: R) -> Result<(), HandlerError> {
        self.publish_with_context(event, RequestContext::new()).await
    }

    /// [`publish`](Self::publish) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_with_context<R: Request>(
        &self,
        event: R,
        ctx: RequestContext,
    ) -> Result<(), HandlerError> {
        let span = info_span!(
            "dispatch",
            mode = "publish",
            request_type = R::request_type(),
            request_id = %event.id(),
        );
        self.run_all(event, ctx).instrument(span).await
    }

    async fn run_all<R: Request>(&self, event: R, ctx: RequestContext) -> Result<(), HandlerError> {
        let pipelines = self.pipelines::<R>()?;
        if pipelines.is_empty() {
            debug!("no subscribers");
            return Ok(());
        }

        let mut errors = Vec::new();
        for pipeline in pipelines {
            let handler = pipeline.handler().to_string();
            if let Err(e) = pipeline.run(Envelope::new(event.clone(), ctx.clone())).await {
                warn!(handler = %handler, error = %e, "subscriber failed");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::Aggregate(errors))
        }
    }

    // -----------------------------------------------------------------------
    // Outbox dispatch
    // -----------------------------------------------------------------------

    /// Deposits `request` and immediately relays it.
    ///
    /// # Errors
    ///
    /// Returns mapping, store, configuration or transport errors. If the relay fails the
    /// entry stays pending for the sweeper.
    pub async fn post<R: Request>(&self, request: &R) -> Result<MessageId, HandlerError> {
        let id = self.deposit_post(request).await?;
        self.relay.clear(&[id]).await?;
        Ok(id)
    }

    /// Maps `request` and stores it in the outbox without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingMapper`], a mapping error or a store error.
    pub async fn deposit_post<R: Request>(&self, request: &R) -> Result<MessageId, HandlerError> {
        let message = self.mappers.get::<R>()?.map_to_message(request)?;
        Ok(self.relay.deposit(message).await?)
    }

    /// Maps every request, then stores them in one batch write.
    ///
    /// # Errors
    ///
    /// Nothing is stored if any request fails to map.
    pub async fn deposit_post_batch<R: Request>(
        &self,
        requests: &[R],
    ) -> Result<Vec<MessageId>, HandlerError> {
        let mapper = self.mappers.get::<R>()?;
        let messages = requests
            .iter()
            .map(|r| mapper.map_to_message(r))
            .collect::<Result<Vec<_>, _>>()?;
        let ids = messages.iter().map(herald_core::Message::id).collect();
        self.relay.outbox().add_batch(messages).await?;
        Ok(ids)
    }

    /// Opens a staging area whose deposits become visible only on commit.
    #[must_use]
    pub fn begin_outbox_transaction(&self) -> OutboxTransaction {
        OutboxTransaction::new(Arc::clone(self.relay.outbox()))
    }

    /// Maps `request` and stages it in `tx`.
    ///
    /// # Errors
    ///
    /// Returns a mapping error, or a store error if `tx` already completed.
    pub fn deposit_post_in<R: Request>(
        &self,
        tx: &mut OutboxTransaction,
        request: &R,
    ) -> Result<MessageId, HandlerError> {
        let message = self.mappers.get::<R>()?.map_to_message(request)?;
        Ok(tx.stage(message)?)
    }

    /// Relays previously deposited messages. Already dispatched ids are skipped.
    ///
    /// # Errors
    ///
    /// See [`OutboxRelay::clear`].
    pub async fn clear_outbox(&self, ids: &[MessageId]) -> Result<usize, HandlerError> {
        self.relay.clear(ids).await
    }
}
