//! Translation between typed requests and wire messages.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{Message, MessageBody, MessageHeader, MessageType};
use crate::request::Request;

/// Errors raised while mapping between a request and a wire message.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to serialize {request_type}: {source}")]
    Serialize {
        request_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize message {message_id} into {request_type}: {reason}")]
    Deserialize {
        request_type: &'static str,
        message_id: String,
        reason: String,
    },

    #[error("message {message_id} has type {actual:?}, expected {expected:?}")]
    UnexpectedType {
        message_id: String,
        expected: MessageType,
        actual: MessageType,
    },
}

/// Pure translation between one request type and its wire form.
///
/// Implementations must be side-effect free: the same input always yields an equivalent
/// output, and nothing is sent or stored.
pub trait MessageMapper<R: Request>: Send + Sync {
    /// Maps a request to a wire message.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Serialize`] if the request cannot be encoded.
    fn map_to_message(&self, request: &R) -> Result<Message, MappingError>;

    /// Maps a wire message back to a request.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Deserialize`] if the body does not decode into `R`.
    fn map_to_request(&self, message: &Message) -> Result<R, MappingError>;
}

// ---------------------------------------------------------------------------
// JsonMessageMapper
// ---------------------------------------------------------------------------

/// Maps requests to JSON bodies published under a fixed topic and message type.
///
/// The message id mirrors the request id so that deposit/clear and inbox checks line up.
pub struct JsonMessageMapper<R> {
    topic: String,
    message_type: MessageType,
    _request: PhantomData<fn() -> R>,
}

impl<R> JsonMessageMapper<R> {
    #[must_use]
    pub fn new(topic: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            topic: topic.into(),
            message_type,
            _request: PhantomData,
        }
    }

    #[must_use]
    pub fn command(topic: impl Into<String>) -> Self {
        Self::new(topic, MessageType::Command)
    }

    #[must_use]
    pub fn event(topic: impl Into<String>) -> Self {
        Self::new(topic, MessageType::Event)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<R> MessageMapper<R> for JsonMessageMapper<R>
where
    R: Request + Serialize + DeserializeOwned,
{
    fn map_to_message(&self, request: &R) -> Result<Message, MappingError> {
        let bytes = serde_json::to_vec(request).map_err(|source| MappingError::Serialize {
            request_type: R::request_type(),
            source,
        })?;
        let mut header = MessageHeader::new(self.topic.clone(), self.message_type);
        header.id = request.id().0.into();
        Ok(Message::new(
            header,
            MessageBody::new(bytes, "application/json"),
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<R, MappingError> {
        serde_json::from_slice(&message.body.bytes).map_err(|e| MappingError::Deserialize {
            request_type: R::request_type(),
            message_id: message.id().to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
