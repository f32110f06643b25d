//! Inbox: once-only processing of inbound requests.
//!
//! Membership is keyed by `(request_id, context_key)`, so the same request may be processed
//! once per context (for example once per handler).

mod memory;

use std::time::SystemTime;

use herald_core::RequestId;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryInbox;

/// Proof that a request was handled under a context key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub request_id: RequestId,
    pub context_key: String,
    pub request_type: String,
    pub timestamp: SystemTime,
}

impl InboxRecord {
    #[must_use]
    pub fn new(
        request_id: RequestId,
        context_key: impl Into<String>,
        request_type: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            context_key: context_key.into(),
            request_type: request_type.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// What an inbox step does when it sees a request it has already handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnceOnlyAction {
    /// Log a warning and skip the rest of the pipeline.
    #[default]
    Warn,
    /// Fail with [`HandlerError::DuplicateRequest`](crate::HandlerError::DuplicateRequest).
    Throw,
}

/// Inbox settings, used both per step and as the processor-wide default.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboxConfiguration {
    /// Context key to record under. Defaults to the handler name.
    pub context_key: Option<String>,
    /// When `false`, requests are always processed and merely recorded.
    pub once_only: bool,
    pub action: OnceOnlyAction,
}

impl InboxConfiguration {
    /// Once-only processing with the given duplicate action.
    #[must_use]
    pub fn once_only(action: OnceOnlyAction) -> Self {
        Self {
            context_key: None,
            once_only: true,
            action,
        }
    }

    #[must_use]
    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = Some(key.into());
        self
    }
}
