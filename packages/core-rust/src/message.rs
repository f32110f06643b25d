//! Wire message model shared by producers, channels, the outbox and the message pump.
//!
//! A [`Message`] is what crosses a transport boundary: a [`MessageHeader`] with routing and
//! correlation metadata plus an opaque [`MessageBody`]. Identity is by [`MessageId`].

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Unique identifier of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Classification of a wire message, used by the message pump to pick a dispatch route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Point-to-point request; dispatched with `send`.
    Command,
    /// Fan-out notification; dispatched with `publish`.
    Event,
    /// Document-style notification; dispatched with `publish`.
    Document,
    /// Untyped message; dispatched with `send`.
    None,
    /// Control sentinel that stops the performer reading it.
    Quit,
    /// Marked by a transport as unreadable.
    Unacceptable,
}

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// Routing and correlation metadata of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: MessageId,
    /// Routing key the message is published under.
    pub topic: String,
    pub message_type: MessageType,
    pub correlation_id: Option<Uuid>,
    /// Topic a reply should be sent to, set by request/reply callers.
    pub reply_to: Option<String>,
    pub partition_key: Option<String>,
    pub content_type: String,
    pub timestamp: SystemTime,
    /// Open metadata carried alongside the message.
    pub bag: HashMap<String, serde_json::Value>,
    /// Number of times the message has been requeued by a consumer.
    pub handled_count: u32,
    /// Delay applied by the last requeue, in milliseconds.
    pub delayed_ms: u64,
}

impl MessageHeader {
    /// Creates a header with a fresh id, the current timestamp and a JSON content type.
    #[must_use]
    pub fn new(topic: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            id: MessageId::new(),
            topic: topic.into(),
            message_type,
            correlation_id: None,
            reply_to: None,
            partition_key: None,
            content_type: "application/json".to_string(),
            timestamp: SystemTime::now(),
            bag: HashMap::new(),
            handled_count: 0,
            delayed_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageBody
// ---------------------------------------------------------------------------

/// Opaque payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageBody {
    pub bytes: Bytes,
    pub content_type: String,
    pub encoding: String,
}

impl MessageBody {
    /// Wraps raw bytes with the given content type and UTF-8 encoding.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            encoding: "utf-8".to_string(),
        }
    }

    /// Returns the body as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A wire message: header plus body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    #[must_use]
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// Creates the quit sentinel that stops one performer loop.
    #[must_use]
    pub fn quit() -> Self {
        Self::new(
            MessageHeader::new(String::new(), MessageType::Quit),
            MessageBody::default(),
        )
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.header.id
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Returns a copy of this message with its handled count incremented.
    ///
    /// Used when a consumer requeues a message for redelivery.
    #[must_use]
    pub fn redelivered(&self, delay_ms: u64) -> Self {
        let mut header = self.header.clone();
        header.handled_count = header.handled_count.saturating_add(1);
        header.delayed_ms = delay_ms;
        Self {
            header,
            body: self.body.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
