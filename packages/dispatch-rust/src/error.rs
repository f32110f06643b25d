//! Error taxonomy for dispatch, relay and consumption.
//!
//! [`HandlerError`] is the single error type that flows through handler pipelines. Narrower
//! enums describe failures of the external collaborators and are folded into it via `From`.

use std::time::Duration;

use herald_core::{MappingError, RequestId};

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

/// Wiring mistakes detected when a pipeline or route is resolved. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no handler registered for {request_type}")]
    NoHandler { request_type: &'static str },

    #[error("{count} handlers registered for {request_type}; send requires exactly one")]
    MultipleHandlers {
        request_type: &'static str,
        count: usize,
    },

    #[error("duplicate {timing} step {step} in pipeline of {handler}")]
    DuplicateStep {
        handler: String,
        timing: &'static str,
        step: u32,
    },

    #[error("policy {name:?} is not registered")]
    MissingPolicy { name: String },

    #[error("middleware {name:?} is not registered for {request_type}")]
    MissingMiddleware {
        name: String,
        request_type: &'static str,
    },

    #[error("no message mapper registered for {request_type}")]
    MissingMapper { request_type: &'static str },

    #[error("no producer registered for topic {topic:?}")]
    MissingProducer { topic: String },

    #[error("pipeline of {handler} uses an inbox step but no inbox is configured")]
    MissingInbox { handler: String },

    #[error("request/reply requires a reply channel factory")]
    MissingReplyChannel,

    #[error("timeout must be greater than zero")]
    InvalidTimeout,
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Failure of a producer or channel talking to a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to send to {topic}: {reason}")]
    Send { topic: String, reason: String },

    #[error("failed to receive from {channel}: {reason}")]
    Receive { channel: String, reason: String },

    #[error("channel {channel} is closed")]
    Closed { channel: String },
}

/// Failure of an outbox or inbox store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entry {id} already exists")]
    Duplicate { id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction already completed")]
    TransactionCompleted,
}

/// Failure of a distributed lock provider.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock provider unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a dispatcher control operation.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("no subscription named {name:?}")]
    UnknownSubscription { name: String },

    #[error("dispatcher has been stopped")]
    Stopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Error raised by a pipeline step, a policy, or the command processor.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Domain failure raised by a business handler.
    #[error(transparent)]
    Business(#[from] anyhow::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("dispatch was cancelled")]
    Cancelled,

    #[error("circuit {policy:?} is open")]
    BrokenCircuit { policy: String },

    #[error("request {request_id} already handled in context {context_key:?}")]
    DuplicateRequest {
        request_id: RequestId,
        context_key: String,
    },

    /// Asks the consuming message pump to requeue the message for later redelivery.
    #[error("handling deferred")]
    Defer { delay: Option<Duration> },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        last: Box<HandlerError>,
    },

    #[error("{} handler(s) failed", .0.len())]
    Aggregate(Vec<HandlerError>),
}

impl HandlerError {
    /// Builds a business failure from any displayable message.
    pub fn business(msg: impl std::fmt::Display) -> Self {
        Self::Business(anyhow::anyhow!("{msg}"))
    }

    /// Requests a requeue with the subscription's default delay.
    #[must_use]
    pub fn defer() -> Self {
        Self::Defer { delay: None }
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns `true` if this error, or any error it wraps, is a configuration error.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.any(&|e| matches!(e, Self::Configuration(_)))
    }

    /// Returns the requested redelivery delay if this error, or any error it wraps, is a defer.
    ///
    /// The outer `Option` is `None` when no defer is present.
    #[must_use]
    pub fn defer_delay(&self) -> Option<Option<Duration>> {
        match self {
            Self::Defer { delay } => Some(*delay),
            Self::Aggregate(errors) => errors.iter().find_map(Self::defer_delay),
            Self::RetryExhausted { last, .. } => last.defer_delay(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_defer(&self) -> bool {
        self.defer_delay().is_some()
    }

    /// Whether a resiliency policy should treat this failure as transient.
    ///
    /// Configuration errors, defers, duplicates and open circuits are deterministic and are
    /// never retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Business(_)
            | Self::Transport(_)
            | Self::Store(_)
            | Self::Lock(_)
            | Self::Timeout { .. }
            | Self::RetryExhausted { .. } => true,
            Self::Aggregate(errors) => errors.iter().all(Self::is_transient),
            _ => false,
        }
    }

    fn any(&self, pred: &dyn Fn(&Self) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Self::Aggregate(errors) => errors.iter().any(|e| e.any(pred)),
            Self::RetryExhausted { last, .. } => last.any(pred),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_is_found_through_wrappers() {
        let err = HandlerError::Aggregate(vec![
            HandlerError::business("boom"),
            HandlerError::RetryExhausted {
                attempts: 2,
                last: Box::new(ConfigurationError::InvalidTimeout.into()),
            },
        ]);
        assert!(err.is_configuration());
        assert!(!HandlerError::business("boom").is_configuration());
    }

    #[test]
    fn defer_delay_is_surfaced_from_aggregate() {
        let err = HandlerError::Aggregate(vec![
            HandlerError::business("boom"),
            HandlerError::Defer {
                delay: Some(Duration::from_millis(20)),
            },
        ]);
        assert_eq!(err.defer_delay(), Some(Some(Duration::from_millis(20))));
        assert!(HandlerError::defer().is_defer());
        assert!(!HandlerError::Cancelled.is_defer());
    }

    #[test]
    fn transient_classification() {
        assert!(HandlerError::business("boom").is_transient());
        assert!(HandlerError::timeout(Duration::from_millis(5)).is_transient());
        assert!(!HandlerError::defer().is_transient());
        assert!(!HandlerError::BrokenCircuit {
            policy: "cb".to_string()
        }
        .is_transient());
        assert!(!HandlerError::from(ConfigurationError::InvalidTimeout).is_transient());
    }

    #[test]
    fn display_messages() {
        let err = HandlerError::RetryExhausted {
            attempts: 4,
            last: Box::new(HandlerError::business("db down")),
        };
        assert_eq!(err.to_string(), "gave up after 4 attempts: db down");
        let agg = HandlerError::Aggregate(vec![HandlerError::Cancelled, HandlerError::Cancelled]);
        assert_eq!(agg.to_string(), "2 handler(s) failed");
    }
}
