//! Outbox: durable staging of outbound messages, relay to producers and sweeping.
//!
//! Messages are deposited as pending entries, then relayed either explicitly
//! (`clear_outbox`) or by the [`OutboxSweeper`]. Every relay path goes through
//! [`Outbox::claim`](crate::traits::Outbox::claim), so racing relays send each entry once.

mod memory;
mod relay;
mod sweeper;

use std::sync::Arc;
use std::time::SystemTime;

use herald_core::{Message, MessageId};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::Outbox;

pub use memory::InMemoryOutbox;
pub use relay::{OutboxRelay, RelayOutcome, SweepReport};
pub use sweeper::{OutboxSweeper, TimedOutboxSweeper};

/// One staged outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub message: Message,
    pub deposited_at: SystemTime,
    /// Set once by the first successful relay.
    pub dispatched_at: Option<SystemTime>,
}

impl OutboxEntry {
    #[must_use]
    pub fn pending(message: Message) -> Self {
        Self {
            message,
            deposited_at: SystemTime::now(),
            dispatched_at: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// OutboxTransaction
// ---------------------------------------------------------------------------

/// Stages deposits so they become visible together with the caller's unit of work.
///
/// Nothing reaches the outbox until [`commit`](Self::commit). Dropping the transaction
/// without committing discards every staged message.
pub struct OutboxTransaction {
    outbox: Arc<dyn Outbox>,
    staged: Vec<Message>,
    completed: bool,
}

impl OutboxTransaction {
    pub(crate) fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            outbox,
            staged: Vec::new(),
            completed: false,
        }
    }

    /// Stages a message and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TransactionCompleted`] after commit or rollback.
    pub fn stage(&mut self, message: Message) -> Result<MessageId, StoreError> {
        if self.completed {
            return Err(StoreError::TransactionCompleted);
        }
        let id = message.id();
        self.staged.push(message);
        Ok(id)
    }

    #[must_use]
    pub fn staged_ids(&self) -> Vec<MessageId> {
        self.staged.iter().map(Message::id).collect()
    }

    /// Writes every staged message to the outbox.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the batch write fails.
    pub async fn commit(mut self) -> Result<Vec<MessageId>, StoreError> {
        self.completed = true;
        let staged = std::mem::take(&mut self.staged);
        let ids = staged.iter().map(Message::id).collect();
        self.outbox.add_batch(staged).await?;
        Ok(ids)
    }

    /// Discards every staged message.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if !self.completed && !self.staged.is_empty() {
            debug!(count = self.staged.len(), "discarding uncommitted outbox deposits");
        }
        self.staged.clear();
        self.completed = true;
    }
}

impl Drop for OutboxTransaction {
    fn drop(&mut self) {
        self.discard();
    }
}
