use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::request::ReplyAddress;

/// Per-dispatch context threaded through every step of a handler pipeline.
///
/// Each pipeline run owns its own copy; `publish` hands every subscriber a separate clone so
/// that bag writes in one pipeline are invisible to the others.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Open key/value state shared between the steps of one pipeline.
    pub bag: HashMap<String, serde_json::Value>,
    /// The wire message this request was mapped from, when dispatched by a message pump.
    pub originating_message: Option<Message>,
    /// Cooperative cancellation signal. Timeout steps replace it with a child token.
    pub cancellation: CancellationToken,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context for a request mapped from `message`.
    #[must_use]
    pub fn from_message(message: Message) -> Self {
        Self {
            originating_message: Some(message),
            ..Self::default()
        }
    }

    /// Returns `true` once an enclosing timeout or the host has cancelled this dispatch.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Reply address of the originating message, if it was sent by a request/reply caller.
    #[must_use]
    pub fn reply_address(&self) -> Option<ReplyAddress> {
        let header = &self.originating_message.as_ref()?.header;
        Some(ReplyAddress {
            topic: header.reply_to.clone()?,
            correlation_id: header.correlation_id?,
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::message::{MessageBody, MessageHeader, MessageType};

    #[test]
    fn reply_address_requires_both_fields() {
        let mut header = MessageHeader::new("rpc", MessageType::Command);
        header.reply_to = Some("reply-queue".to_string());
        let ctx = RequestContext::from_message(Message::new(header.clone(), MessageBody::default()));
        assert!(ctx.reply_address().is_none());

        let correlation_id = Uuid::new_v4();
        header.correlation_id = Some(correlation_id);
        let ctx = RequestContext::from_message(Message::new(header, MessageBody::default()));
        let address = ctx.reply_address().unwrap();
        assert_eq!(address.topic, "reply-queue");
        assert_eq!(address.correlation_id, correlation_id);
    }

    #[test]
    fn clones_share_cancellation() {
        let ctx = RequestContext::new();
        let copy = ctx.clone();
        ctx.cancellation.cancel();
        assert!(copy.is_cancelled());
    }
}
