//! Request/reply over a transport.

use std::sync::Arc;
use std::time::Duration;

use herald_core::{Message, ReplyAddress, Request, RequestContext};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::CommandProcessor;
use crate::error::{ConfigurationError, HandlerError};
use crate::pump::Subscription;
use crate::traits::Channel;

/// Closes the ephemeral reply channel however `call` exits.
struct ReplyChannelGuard(Arc<dyn Channel>);

impl Drop for ReplyChannelGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl CommandProcessor {
    /// Sends `request` to its topic and waits for a correlated reply, which is then sent
    /// through the local pipeline for `Resp`.
    ///
    /// A private, non-durable reply channel is opened for the call and closed on every exit
    /// path, including timeout and cancellation of the returned future. Messages on the reply
    /// channel with a different correlation id are acknowledged and ignored.
    ///
    /// `timeout` defaults to [`ProcessorConfig::default_call_timeout_ms`](crate::ProcessorConfig).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidTimeout`] for a zero timeout,
    /// [`ConfigurationError::MissingReplyChannel`] when no reply channel factory is configured,
    /// [`HandlerError::Timeout`] when no reply arrives in time, or any mapping, transport or
    /// pipeline error.
    pub async fn call<R, Resp>(
        &self,
        request: &R,
        timeout: Option<Duration>,
    ) -> Result<Resp, HandlerError>
    where
        R: Request,
        Resp: Request,
    {
        let timeout = timeout.unwrap_or_else(|| self.config.default_call_timeout());
        if timeout.is_zero() {
            return Err(ConfigurationError::InvalidTimeout.into());
        }
        let span = info_span!(
            "call",
            request_type = R::request_type(),
            request_id = %request.id(),
        );
        self.round_trip(request, timeout).instrument(span).await
    }

    async fn round_trip<R, Resp>(&self, request: &R, timeout: Duration) -> Result<Resp, HandlerError>
    where
        R: Request,
        Resp: Request,
    {
        let factory = self
            .reply_channels
            .as_ref()
            .ok_or(ConfigurationError::MissingReplyChannel)?;
        let request_mapper = self.mappers.get::<R>()?;
        let reply_mapper = self.mappers.get::<Resp>()?;

        let correlation_id = Uuid::new_v4();
        let reply_to = format!("reply.{correlation_id}");
        let subscription =
            Subscription::new(reply_to.clone(), reply_to.clone(), reply_to.clone()).durable(false);
        let channel = factory.create_channel(&subscription)?;
        let _guard = ReplyChannelGuard(Arc::clone(&channel));

        let mut message = request_mapper.map_to_message(request)?;
        message.header.reply_to = Some(reply_to);
        message.header.correlation_id = Some(correlation_id);
        let producer = self.producers.lookup(&message.header.topic)?;
        producer.send(&message).await?;
        debug!(topic = %message.header.topic, %correlation_id, "request sent, awaiting reply");

        let reply = tokio::time::timeout(
            timeout,
            await_reply(channel.as_ref(), correlation_id, timeout),
        )
        .await
        .map_err(|_| HandlerError::timeout(timeout))??;

        let response = reply_mapper.map_to_request(&reply)?;
        self.send_with_context(response, RequestContext::from_message(reply))
            .await
    }

    /// Sends `response` to the caller waiting at `address`.
    ///
    /// Replies go straight to the producer for the reply topic; they are not staged in the
    /// outbox.
    ///
    /// # Errors
    ///
    /// Returns mapping, configuration or transport errors.
    pub async fn reply<Resp: Request>(
        &self,
        response: &Resp,
        address: &ReplyAddress,
    ) -> Result<(), HandlerError> {
        let mut message = self.mappers.get::<Resp>()?.map_to_message(response)?;
        message.header.topic.clone_from(&address.topic);
        message.header.correlation_id = Some(address.correlation_id);
        let producer = self.producers.lookup(&address.topic)?;
        producer.send(&message).await?;
        debug!(
            topic = %address.topic,
            correlation_id = %address.correlation_id,
            "reply sent"
        );
        Ok(())
    }
}

async fn await_reply(
    channel: &dyn Channel,
    correlation_id: Uuid,
    poll: Duration,
) -> Result<Message, HandlerError> {
    loop {
        let Some(message) = channel.receive(poll).await? else {
            continue;
        };
        channel.acknowledge(&message).await?;
        if message.header.correlation_id == Some(correlation_id) {
            return Ok(message);
        }
        debug!(
            message_id = %message.id(),
            "ignoring uncorrelated message on reply channel"
        );
    }
}
