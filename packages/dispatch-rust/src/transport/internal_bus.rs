//! In-process transport: routing-key keyed FIFO queues with competing consumers.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use herald_core::Message;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::pump::Subscription;
use crate::traits::{Channel, ChannelFactory, Producer};

// ---------------------------------------------------------------------------
// InternalBus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
}

/// How many closed routing keys are remembered before the oldest is forgotten.
const CLOSED_KEY_CAPACITY: usize = 1024;

/// Routing keys of recently closed ephemeral queues, oldest first.
#[derive(Default)]
struct ClosedKeys {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl ClosedKeys {
    fn insert(&mut self, routing_key: &str) {
        if !self.keys.insert(routing_key.to_string()) {
            return;
        }
        self.order.push_back(routing_key.to_string());
        while self.order.len() > CLOSED_KEY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, routing_key: &str) {
        if self.keys.remove(routing_key) {
            self.order.retain(|key| key != routing_key);
        }
    }
}

/// Shared set of in-memory queues, one per routing key.
///
/// Each message is handed to exactly one receiver, whichever wakes first. Messages sent to a
/// closed key are dead-lettered rather than recreating its queue.
#[derive(Default)]
pub struct InternalBus {
    queues: DashMap<String, Arc<Queue>>,
    closed: Mutex<ClosedKeys>,
    dead_letters: Mutex<Vec<Message>>,
}

impl InternalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue for `routing_key`, created on first use. `None` once the key is closed.
    fn queue(&self, routing_key: &str) -> Option<Arc<Queue>> {
        let closed = self.closed.lock();
        if closed.keys.contains(routing_key) {
            return None;
        }
        if let Some(queue) = self.queues.get(routing_key) {
            return Some(Arc::clone(queue.value()));
        }
        Some(Arc::clone(
            self.queues.entry(routing_key.to_string()).or_default().value(),
        ))
    }

    pub fn enqueue(&self, routing_key: &str, message: Message) {
        let Some(queue) = self.queue(routing_key) else {
            debug!(routing_key, message_id = %message.id(), "routing key closed, dead-lettering");
            self.dead_letter(message);
            return;
        };
        queue.messages.lock().push_back(message);
        queue.available.notify_one();
    }

    /// Waits up to `timeout` for a message on `routing_key`. Returns `None` at once for a
    /// closed key.
    pub async fn dequeue(&self, routing_key: &str, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        let queue = self.queue(routing_key)?;
        loop {
            let notified = queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut messages = queue.messages.lock();
                let popped = messages.pop_front();
                if popped.is_some() && !messages.is_empty() {
                    queue.available.notify_one();
                }
                popped
            };
            if popped.is_some() {
                return popped;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Number of messages waiting on `routing_key`.
    #[must_use]
    pub fn stream_len(&self, routing_key: &str) -> usize {
        self.queues
            .get(routing_key)
            .map_or(0, |queue| queue.messages.lock().len())
    }

    pub fn dead_letter(&self, message: Message) {
        self.dead_letters.lock().push(message);
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<Message> {
        self.dead_letters.lock().clone()
    }

    /// Removes a queue and everything still in it, and refuses further messages for the key
    /// until it is reopened.
    pub fn close(&self, routing_key: &str) {
        let mut closed = self.closed.lock();
        closed.insert(routing_key);
        self.queues.remove(routing_key);
    }

    /// Accepts messages for a previously closed key again.
    pub fn reopen(&self, routing_key: &str) {
        self.closed.lock().remove(routing_key);
    }

    #[must_use]
    pub fn is_closed(&self, routing_key: &str) -> bool {
        self.closed.lock().keys.contains(routing_key)
    }

    #[must_use]
    pub fn has_queue(&self, routing_key: &str) -> bool {
        self.queues.contains_key(routing_key)
    }

    /// Drops every queue, closed key and dead letter. Intended for test teardown.
    pub fn clear(&self) {
        *self.closed.lock() = ClosedKeys::default();
        self.queues.clear();
        self.dead_letters.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// InMemoryProducer
// ---------------------------------------------------------------------------

/// Publishes onto an [`InternalBus`] under each message's topic.
pub struct InMemoryProducer {
    bus: Arc<InternalBus>,
    sent: Mutex<Vec<Message>>,
}

impl InMemoryProducer {
    #[must_use]
    pub fn new(bus: Arc<InternalBus>) -> Self {
        Self {
            bus,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every message sent so far, in send order.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        trace!(topic = %message.header.topic, message_id = %message.id(), "producing");
        self.sent.lock().push(message.clone());
        self.bus.enqueue(&message.header.topic, message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryChannel
// ---------------------------------------------------------------------------

/// Consumer view of one [`InternalBus`] queue.
pub struct InMemoryChannel {
    name: String,
    routing_key: String,
    bus: Arc<InternalBus>,
    /// Non-durable channels remove their queue on close and refuse late messages.
    durable: bool,
}

impl InMemoryChannel {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        routing_key: impl Into<String>,
        bus: Arc<InternalBus>,
        durable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            routing_key: routing_key.into(),
            bus,
            durable,
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if self.bus.is_closed(&self.routing_key) {
            return Err(TransportError::Closed {
                channel: self.name.clone(),
            });
        }
        Ok(self.bus.dequeue(&self.routing_key, timeout).await)
    }

    async fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        self.bus.enqueue(&self.routing_key, message);
        Ok(())
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), TransportError> {
        trace!(channel = %self.name, message_id = %message.id(), "acknowledged");
        Ok(())
    }

    async fn reject(&self, message: &Message) -> Result<(), TransportError> {
        debug!(channel = %self.name, message_id = %message.id(), "rejected to dead letters");
        self.bus.dead_letter(message.clone());
        Ok(())
    }

    async fn requeue(&self, message: Message, delay: Duration) -> Result<(), TransportError> {
        if delay.is_zero() {
            self.bus.enqueue(&self.routing_key, message);
            return Ok(());
        }
        let bus = Arc::clone(&self.bus);
        let routing_key = self.routing_key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.enqueue(&routing_key, message);
        });
        Ok(())
    }

    fn close(&self) {
        if !self.durable {
            self.bus.close(&self.routing_key);
        }
    }
}

/// Creates [`InMemoryChannel`]s over a shared [`InternalBus`].
pub struct InMemoryChannelFactory {
    bus: Arc<InternalBus>,
}

impl InMemoryChannelFactory {
    #[must_use]
    pub fn new(bus: Arc<InternalBus>) -> Self {
        Self { bus }
    }
}

impl ChannelFactory for InMemoryChannelFactory {
    fn create_channel(
        &self,
        subscription: &Subscription,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        self.bus.reopen(&subscription.routing_key);
        Ok(Arc::new(InMemoryChannel::new(
            subscription.channel_name.clone(),
            subscription.routing_key.clone(),
            Arc::clone(&self.bus),
            subscription.is_durable,
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
