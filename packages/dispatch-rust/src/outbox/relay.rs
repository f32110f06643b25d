use std::sync::Arc;
use std::time::{Duration, SystemTime};

use herald_core::{Message, MessageId};
use tracing::{debug, warn};

use crate::error::{HandlerError, StoreError};
use crate::traits::Outbox;
use crate::transport::ProducerRegistry;

/// Result of relaying one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// This relay claimed the entry and the producer accepted it.
    Dispatched,
    /// The entry is unknown, already dispatched, or claimed by another relay.
    Skipped,
}

/// Tally of one pass over outstanding entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub relayed: usize,
    pub failed: usize,
}

/// Moves outbox entries to their producers.
///
/// Every path claims the entry first, so concurrent relays of one id send it at most once.
/// A failed send releases the claim and leaves the entry pending.
pub struct OutboxRelay {
    outbox: Arc<dyn Outbox>,
    producers: Arc<ProducerRegistry>,
    claim_lease: Duration,
}

impl OutboxRelay {
    #[must_use]
    pub fn new(
        outbox: Arc<dyn Outbox>,
        producers: Arc<ProducerRegistry>,
        claim_lease: Duration,
    ) -> Self {
        Self {
            outbox,
            producers,
            claim_lease,
        }
    }

    #[must_use]
    pub fn outbox(&self) -> &Arc<dyn Outbox> {
        &self.outbox
    }

    /// Stores `message` as pending and returns its id.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the write fails.
    pub async fn deposit(&self, message: Message) -> Result<MessageId, StoreError> {
        let id = message.id();
        self.outbox.add(message).await?;
        debug!(message_id = %id, "deposited to outbox");
        Ok(id)
    }

    /// Relays one entry if this call wins its claim.
    ///
    /// # Errors
    ///
    /// Returns a store, configuration or transport error. On a send failure the claim is
    /// released so a later clear or sweep can retry.
    pub async fn relay(&self, id: MessageId) -> Result<RelayOutcome, HandlerError> {
        let Some(entry) = self.outbox.claim(id, self.claim_lease).await? else {
            debug!(message_id = %id, "outbox entry not claimable, skipping");
            return Ok(RelayOutcome::Skipped);
        };

        let topic = entry.message.header.topic.as_str();
        let sent = match self.producers.lookup(topic) {
            Ok(producer) => producer.send(&entry.message).await.map_err(HandlerError::from),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = sent {
            metrics::counter!("herald_outbox_relay_failures_total").increment(1);
            warn!(message_id = %id, topic, error = %e, "outbox relay failed, entry left pending");
            self.outbox.release(id).await?;
            return Err(e);
        }

        self.outbox.mark_dispatched(id, SystemTime::now()).await?;
        metrics::counter!("herald_outbox_relayed_total").increment(1);
        debug!(message_id = %id, topic, "relayed outbox entry");
        Ok(RelayOutcome::Dispatched)
    }

    /// Relays each id in order and returns how many this call dispatched.
    ///
    /// Ids that are unknown or already dispatched are skipped. Every id is attempted even if
    /// an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the single failure, or [`HandlerError::Aggregate`] when several ids failed.
    pub async fn clear(&self, ids: &[MessageId]) -> Result<usize, HandlerError> {
        let mut dispatched = 0;
        let mut errors = Vec::new();
        for id in ids {
            match self.relay(*id).await {
                Ok(RelayOutcome::Dispatched) => dispatched += 1,
                Ok(RelayOutcome::Skipped) => {}
                Err(e) => errors.push(e),
            }
        }
        match errors.len() {
            0 => Ok(dispatched),
            1 => Err(errors.remove(0)),
            _ => Err(HandlerError::Aggregate(errors)),
        }
    }

    /// Relays up to `batch_size` pending entries at least `min_age` old, oldest first.
    ///
    /// Per-entry failures are counted and logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns the store's error if outstanding entries cannot be listed.
    pub async fn clear_outstanding(
        &self,
        min_age: Duration,
        batch_size: usize,
    ) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        for entry in self.outbox.outstanding(min_age, batch_size).await? {
            match self.relay(entry.id()).await {
                Ok(RelayOutcome::Dispatched) => report.relayed += 1,
                Ok(RelayOutcome::Skipped) => {}
                Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use herald_core::{MessageBody, MessageHeader, MessageType};

    use super::*;
    use crate::error::TransportError;
    use crate::outbox::InMemoryOutbox;
    use crate::traits::Producer;

    #[derive(Default)]
    struct FlakyProducer {
        failing: AtomicBool,
        sent: AtomicU32,
    }

    #[async_trait]
    impl Producer for FlakyProducer {
        async fn send(&self, message: &Message) -> Result<(), TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Send {
                    topic: message.header.topic.clone(),
                    reason: "broker down".to_string(),
                });
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message() -> Message {
        Message::new(
            MessageHeader::new("orders", MessageType::Event),
            MessageBody::new("{}", "application/json"),
        )
    }

    fn relay() -> (Arc<InMemoryOutbox>, Arc<FlakyProducer>, OutboxRelay) {
        let outbox = Arc::new(InMemoryOutbox::new());
        let producer = Arc::new(FlakyProducer::default());
        let relay = OutboxRelay::new(
            outbox.clone(),
            Arc::new(ProducerRegistry::single(producer.clone())),
            Duration::from_secs(30),
        );
        (outbox, producer, relay)
    }

    #[tokio::test]
    async fn clearing_twice_relays_once() {
        let (outbox, producer, relay) = relay();
        let id = relay.deposit(message()).await.unwrap();

        assert_eq!(relay.clear(&[id]).await.unwrap(), 1);
        assert_eq!(relay.clear(&[id]).await.unwrap(), 0);
        assert_eq!(producer.sent.load(Ordering::SeqCst), 1);
        assert!(outbox.get(id).await.unwrap().unwrap().is_dispatched());
    }

    #[tokio::test]
    async fn send_failure_leaves_entry_pending() {
        let (outbox, producer, relay) = relay();
        let id = relay.deposit(message()).await.unwrap();

        producer.failing.store(true, Ordering::SeqCst);
        let err = relay.clear(&[id]).await.unwrap_err();
        assert!(matches!(err, HandlerError::Transport(_)));
        assert!(!outbox.get(id).await.unwrap().unwrap().is_dispatched());

        producer.failing.store(false, Ordering::SeqCst);
        assert_eq!(relay.relay(id).await.unwrap(), RelayOutcome::Dispatched);
    }

    #[tokio::test]
    async fn several_failures_are_aggregated() {
        let (_outbox, producer, relay) = relay();
        let a = relay.deposit(message()).await.unwrap();
        let b = relay.deposit(message()).await.unwrap();
        producer.failing.store(true, Ordering::SeqCst);

        let err = relay.clear(&[a, b]).await.unwrap_err();
        assert!(matches!(err, HandlerError::Aggregate(ref errors) if errors.len() == 2));
    }

    #[tokio::test]
    async fn missing_producer_is_a_configuration_error() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let relay = OutboxRelay::new(
            outbox,
            Arc::new(ProducerRegistry::new()),
            Duration::from_secs(30),
        );
        let id = relay.deposit(message()).await.unwrap();
        assert!(relay.relay(id).await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn concurrent_relays_send_once() {
        let (_outbox, producer, relay) = relay();
        let relay = Arc::new(relay);
        let id = relay.deposit(message()).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let relay = relay.clone();
                tokio::spawn(async move { relay.relay(id).await.unwrap() })
            })
            .collect();
        let mut dispatched = 0;
        for handle in handles {
            if handle.await.unwrap() == RelayOutcome::Dispatched {
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 1);
        assert_eq!(producer.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_outstanding_counts_failures() {
        let (_outbox, producer, relay) = relay();
        relay.deposit(message()).await.unwrap();
        relay.deposit(message()).await.unwrap();

        producer.failing.store(true, Ordering::SeqCst);
        let report = relay.clear_outstanding(Duration::ZERO, 10).await.unwrap();
        assert_eq!(report, SweepReport { relayed: 0, failed: 2 });

        producer.failing.store(false, Ordering::SeqCst);
        let report = relay.clear_outstanding(Duration::ZERO, 10).await.unwrap();
        assert_eq!(report, SweepReport { relayed: 2, failed: 0 });
    }
}
