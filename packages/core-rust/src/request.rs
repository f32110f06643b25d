//! Typed request model.
//!
//! Requests are the in-process counterpart of wire messages. Commands expect exactly one
//! handler and are dispatched with `send`; events expect zero or more and go through `publish`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier carried by every request. Used as the inbox dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A typed business request routed through a handler pipeline.
///
/// Implementors are plain data; the pipeline mutates them only while handlers run. `Clone`
/// lets retries start from the pre-attempt state and gives each `publish` subscriber its
/// own copy.
pub trait Request: Clone + Send + Sync + 'static {
    fn id(&self) -> RequestId;

    /// Name used in logs and error messages.
    fn request_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Where a reply to a request/reply call should be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyAddress {
    pub topic: String,
    pub correlation_id: Uuid,
}
