//! Contracts for the external collaborators the dispatch engine consumes.
//!
//! Concrete transports and durable stores live outside this crate. In-memory reference
//! implementations are provided in [`crate::transport`], [`crate::outbox`], [`crate::inbox`]
//! and [`crate::lock`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use herald_core::{Message, MessageId, RequestId};

use crate::error::{LockError, StoreError, TransportError};
use crate::inbox::InboxRecord;
use crate::lock::LockToken;
use crate::outbox::OutboxEntry;
use crate::pump::Subscription;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Sends wire messages to a transport. Failures must be returned, never swallowed.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), TransportError>;
}

/// A consumer-side view of one queue.
///
/// Implementations must tolerate concurrent callers: every performer of a subscription
/// shares one channel and each message is delivered to at most one of them.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Waits up to `timeout` for the next message. `Ok(None)` means the queue was empty.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// Puts a message directly onto this channel's queue (used for quit sentinels).
    async fn enqueue(&self, message: Message) -> Result<(), TransportError>;

    async fn acknowledge(&self, message: &Message) -> Result<(), TransportError>;

    /// Removes the message from active processing (dead-letter or discard).
    async fn reject(&self, message: &Message) -> Result<(), TransportError>;

    /// Returns the message to the queue for redelivery after `delay`.
    async fn requeue(&self, message: Message, delay: Duration) -> Result<(), TransportError>;

    /// Tears down any transport-side subscription. Must be idempotent.
    fn close(&self) {}
}

/// Creates channels for subscriptions, including ephemeral request/reply channels.
pub trait ChannelFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport refuses the subscription.
    fn create_channel(&self, subscription: &Subscription)
        -> Result<Arc<dyn Channel>, TransportError>;
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Durable staging of outbound messages.
///
/// `claim` is the atomic check-and-set that serializes relays: of any number of concurrent
/// claims for one pending entry, exactly one returns it.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Stores a message as pending. Adding an id that already exists is a no-op.
    async fn add(&self, message: Message) -> Result<(), StoreError>;

    async fn add_batch(&self, messages: Vec<Message>) -> Result<(), StoreError> {
        for message in messages {
            self.add(message).await?;
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxEntry>, StoreError>;

    /// Claims a pending entry for relay. Returns `None` if it is missing, already
    /// dispatched, or claimed by someone else whose lease has not expired.
    async fn claim(&self, id: MessageId, lease: Duration) -> Result<Option<OutboxEntry>, StoreError>;

    /// Records a successful relay. Marking an already dispatched entry is a no-op.
    async fn mark_dispatched(&self, id: MessageId, at: SystemTime) -> Result<(), StoreError>;

    /// Returns a claimed entry to pending after a failed relay.
    async fn release(&self, id: MessageId) -> Result<(), StoreError>;

    /// Pending entries deposited at least `min_age` ago, oldest first, at most `limit`.
    async fn outstanding(&self, min_age: Duration, limit: usize)
        -> Result<Vec<OutboxEntry>, StoreError>;

    /// Entries dispatched within the last `max_age`.
    async fn dispatched_since(&self, max_age: Duration) -> Result<Vec<OutboxEntry>, StoreError>;
}

/// Dedup store for inbound requests, keyed by `(request_id, context_key)`.
#[async_trait]
pub trait Inbox: Send + Sync {
    async fn add(&self, record: InboxRecord) -> Result<(), StoreError>;

    async fn exists(&self, request_id: RequestId, context_key: &str) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

/// Cluster-wide mutual exclusion keyed by resource name.
///
/// For a given resource at most one successful `obtain_lock` is outstanding until the
/// matching `release_lock` (or until the provider's lease expires).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries to take the lock without waiting. `Ok(None)` means someone else holds it.
    async fn obtain_lock(&self, resource: &str) -> Result<Option<LockToken>, LockError>;

    /// Releases a lock held with `token`. Returns `false` if the token no longer holds it.
    async fn release_lock(&self, resource: &str, token: &LockToken) -> Result<bool, LockError>;
}
