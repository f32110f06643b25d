use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use herald_core::{Message, MessageId};
use tokio::time::Instant;

use super::OutboxEntry;
use crate::error::StoreError;
use crate::traits::Outbox;

#[derive(Debug, Clone)]
struct Slot {
    entry: OutboxEntry,
    claimed_until: Option<Instant>,
}

impl Slot {
    fn is_claimed(&self, now: Instant) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Process-local [`Outbox`] backed by a `DashMap`.
///
/// Entries are never evicted by the relay path; dispatched entries remain for inspection.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    entries: DashMap<MessageId, Slot>,
}

impl InMemoryOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Drops every entry. Intended for test teardown.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn age(at: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(at).unwrap_or(Duration::ZERO)
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn add(&self, message: Message) -> Result<(), StoreError> {
        self.entries.entry(message.id()).or_insert_with(|| Slot {
            entry: OutboxEntry::pending(message),
            claimed_until: None,
        });
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(self.entries.get(&id).map(|slot| slot.entry.clone()))
    }

    async fn claim(&self, id: MessageId, lease: Duration) -> Result<Option<OutboxEntry>, StoreError> {
        let now = Instant::now();
        let Some(mut slot) = self.entries.get_mut(&id) else {
            return Ok(None);
        };
        if slot.entry.is_dispatched() || slot.is_claimed(now) {
            return Ok(None);
        }
        slot.claimed_until = Some(now + lease);
        Ok(Some(slot.entry.clone()))
    }

    async fn mark_dispatched(&self, id: MessageId, at: SystemTime) -> Result<(), StoreError> {
        if let Some(mut slot) = self.entries.get_mut(&id) {
            if slot.entry.dispatched_at.is_none() {
                slot.entry.dispatched_at = Some(at);
            }
            slot.claimed_until = None;
        }
        Ok(())
    }

    async fn release(&self, id: MessageId) -> Result<(), StoreError> {
        if let Some(mut slot) = self.entries.get_mut(&id) {
            slot.claimed_until = None;
        }
        Ok(())
    }

    async fn outstanding(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let now = SystemTime::now();
        let instant = Instant::now();
        let mut pending: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|slot| !slot.entry.is_dispatched() && !slot.is_claimed(instant))
            .filter(|slot| age(slot.entry.deposited_at, now) >= min_age)
            .map(|slot| slot.entry.clone())
            .collect();
        pending.sort_by_key(|entry| entry.deposited_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn dispatched_since(&self, max_age: Duration) -> Result<Vec<OutboxEntry>, StoreError> {
        let now = SystemTime::now();
        Ok(self
            .entries
            .iter()
            .filter(|slot| {
                slot.entry
                    .dispatched_at
                    .is_some_and(|at| age(at, now) <= max_age)
            })
            .map(|slot| slot.entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use herald_core::{MessageBody, MessageHeader, MessageType};

    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn message(topic: &str) -> Message {
        Message::new(
            MessageHeader::new(topic, MessageType::Command),
            MessageBody::new("{}", "application/json"),
        )
    }

    #[tokio::test]
    async fn adding_an_existing_id_is_a_noop() {
        let outbox = InMemoryOutbox::new();
        let msg = message("a");
        outbox.add(msg.clone()).await.unwrap();
        outbox.mark_dispatched(msg.id(), SystemTime::now()).await.unwrap();
        outbox.add(msg.clone()).await.unwrap();
        assert_eq!(outbox.entry_count(), 1);
        assert!(outbox.get(msg.id()).await.unwrap().unwrap().is_dispatched());
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let msg = message("a");
        outbox.add(msg.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let outbox = Arc::clone(&outbox);
            let id = msg.id();
            handles.push(tokio::spawn(async move {
                outbox.claim(id, LEASE).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn dispatched_entries_cannot_be_claimed() {
        let outbox = InMemoryOutbox::new();
        let msg = message("a");
        outbox.add(msg.clone()).await.unwrap();
        assert!(outbox.claim(msg.id(), LEASE).await.unwrap().is_some());
        outbox.mark_dispatched(msg.id(), SystemTime::now()).await.unwrap();
        assert!(outbox.claim(msg.id(), LEASE).await.unwrap().is_none());
        assert!(outbox.claim(MessageId::new(), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_dispatched_twice_keeps_first_timestamp() {
        let outbox = InMemoryOutbox::new();
        let msg = message("a");
        outbox.add(msg.clone()).await.unwrap();
        let first = SystemTime::now();
        outbox.mark_dispatched(msg.id(), first).await.unwrap();
        outbox
            .mark_dispatched(msg.id(), first + Duration::from_secs(10))
            .await
            .unwrap();
        let entry = outbox.get(msg.id()).await.unwrap().unwrap();
        assert_eq!(entry.dispatched_at, Some(first));
    }

    #[tokio::test]
    async fn released_claim_is_pending_again() {
        let outbox = InMemoryOutbox::new();
        let msg = message("a");
        outbox.add(msg.clone()).await.unwrap();
        outbox.claim(msg.id(), LEASE).await.unwrap().unwrap();
        assert!(outbox.outstanding(Duration::ZERO, 10).await.unwrap().is_empty());
        outbox.release(msg.id()).await.unwrap();
        assert_eq!(outbox.outstanding(Duration::ZERO, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_claim_can_be_taken_again() {
        let outbox = InMemoryOutbox::new();
        let msg = message("a");
        outbox.add(msg.clone()).await.unwrap();
        outbox.claim(msg.id(), Duration::from_secs(1)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(outbox.claim(msg.id(), LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn outstanding_respects_age_limit_and_dispatch() {
        let outbox = InMemoryOutbox::new();
        let sent = message("a");
        outbox.add(sent.clone()).await.unwrap();
        outbox.mark_dispatched(sent.id(), SystemTime::now()).await.unwrap();
        for _ in 0..3 {
            outbox.add(message("b")).await.unwrap();
        }

        assert_eq!(outbox.outstanding(Duration::ZERO, 2).await.unwrap().len(), 2);
        assert_eq!(outbox.outstanding(Duration::ZERO, 10).await.unwrap().len(), 3);
        assert!(outbox
            .outstanding(Duration::from_secs(3600), 10)
            .await
            .unwrap()
            .is_empty());

        let recent = outbox.dispatched_since(Duration::from_secs(60)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id(), sent.id());
    }
}
