use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use herald_core::{Message, MessageType, Request, RequestContext};
use tracing::{debug, error, info, warn};

use super::{ConsumerState, Subscription};
use crate::error::{HandlerError, TransportError};
use crate::processor::CommandProcessor;
use crate::traits::Channel;

/// Why a performer loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Received a quit sentinel.
    Quit,
    /// Too many consecutive unacceptable messages.
    UnacceptableLimit,
    /// A message could not be dispatched because of a wiring mistake.
    Configuration,
    /// The channel reported itself closed.
    ChannelClosed,
}

/// What the loop does with a message after handling it.
enum Disposition {
    Acknowledge,
    /// Handler failed; the message is acknowledged and counted as failed.
    Failed,
    Requeue(Duration),
    Reject,
    Unacceptable,
    Stop(PumpExit),
}

/// One performer loop for request type `R`.
///
/// State machine: Running -> (receive) -> {empty -> Running, quit -> Stopped,
/// message -> dispatch -> Running}
pub struct MessagePump<R> {
    processor: Arc<CommandProcessor>,
    channel: Arc<dyn Channel>,
    subscription: Arc<Subscription>,
    performer: String,
    state: Arc<ArcSwap<ConsumerState>>,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> MessagePump<R> {
    #[must_use]
    pub fn new(
        processor: Arc<CommandProcessor>,
        channel: Arc<dyn Channel>,
        subscription: Arc<Subscription>,
        performer: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            channel,
            subscription,
            performer: performer.into(),
            state: Arc::new(ArcSwap::from_pointee(ConsumerState::Running)),
            _request: PhantomData,
        }
    }

    /// Shared handle to this performer's state, for health views.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<ConsumerState>> {
        Arc::clone(&self.state)
    }

    /// Runs until a quit sentinel, a stop condition, or a closed channel.
    pub async fn run(self) -> PumpExit {
        info!(
            subscription = %self.subscription.name,
            performer = %self.performer,
            channel = self.channel.name(),
            "performer started"
        );
        let mut unacceptable = 0u32;

        let exit = loop {
            let message = match self.channel.receive(self.subscription.timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tokio::time::sleep(self.subscription.empty_channel_delay).await;
                    continue;
                }
                Err(TransportError::Closed { .. }) => break PumpExit::ChannelClosed,
                Err(e) => {
                    warn!(
                        performer = %self.performer,
                        error = %e,
                        "failed to receive, backing off"
                    );
                    tokio::time::sleep(self.subscription.channel_failure_delay).await;
                    continue;
                }
            };

            let disposition = match message.message_type() {
                MessageType::Quit => {
                    self.settle(&message, Disposition::Acknowledge).await;
                    break PumpExit::Quit;
                }
                MessageType::Unacceptable => Disposition::Unacceptable,
                _ => self.dispatch(&message).await,
            };

            match disposition {
                Disposition::Unacceptable => {
                    unacceptable = unacceptable.saturating_add(1);
                    self.settle(&message, Disposition::Unacceptable).await;
                    if self.subscription.unacceptable_limit_reached(unacceptable) {
                        warn!(
                            performer = %self.performer,
                            limit = self.subscription.unacceptable_message_limit,
                            "unacceptable message limit reached, stopping"
                        );
                        break PumpExit::UnacceptableLimit;
                    }
                }
                Disposition::Stop(exit) => {
                    self.settle(&message, Disposition::Reject).await;
                    break exit;
                }
                other => {
                    unacceptable = 0;
                    self.settle(&message, other).await;
                }
            }
        };

        self.state.store(Arc::new(ConsumerState::Stopped));
        info!(performer = %self.performer, ?exit, "performer stopped");
        exit
    }

    async fn dispatch(&self, message: &Message) -> Disposition {
        let request = match self.map(message) {
            Ok(request) => request,
            Err(e) if e.is_configuration() => {
                error!(performer = %self.performer, error = %e, "cannot map message, stopping");
                return Disposition::Stop(PumpExit::Configuration);
            }
            Err(e) => {
                warn!(
                    performer = %self.performer,
                    message_id = %message.id(),
                    error = %e,
                    "unacceptable message"
                );
                return Disposition::Unacceptable;
            }
        };

        let ctx = RequestContext::from_message(message.clone());
        let result = match message.message_type() {
            MessageType::Event | MessageType::Document => {
                self.processor.publish_with_context(request, ctx).await
            }
            _ => self
                .processor
                .send_with_context(request, ctx)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => Disposition::Acknowledge,
            Err(e) => self.on_failure(message, &e),
        }
    }

    fn map(&self, message: &Message) -> Result<R, HandlerError> {
        let mapper = self.processor.mappers().get::<R>()?;
        Ok(mapper.map_to_request(message)?)
    }

    fn on_failure(&self, message: &Message, e: &HandlerError) -> Disposition {
        if e.is_configuration() {
            error!(performer = %self.performer, error = %e, "configuration error, stopping");
            return Disposition::Stop(PumpExit::Configuration);
        }
        if let Some(delay) = e.defer_delay() {
            let handled = message.header.handled_count;
            if !self.subscription.may_requeue(handled) {
                warn!(
                    performer = %self.performer,
                    message_id = %message.id(),
                    handled_count = handled,
                    "requeue limit exhausted, rejecting"
                );
                return Disposition::Reject;
            }
            return Disposition::Requeue(delay.unwrap_or(self.subscription.requeue_delay));
        }
        error!(
            performer = %self.performer,
            message_id = %message.id(),
            error = %e,
            "failed to dispatch message, acknowledging"
        );
        Disposition::Failed
    }

    /// Hands the message back to the channel. Channel errors are logged, not fatal.
    async fn settle(&self, message: &Message, disposition: Disposition) {
        let result = match disposition {
            Disposition::Acknowledge => {
                if message.message_type() != MessageType::Quit {
                    self.record("dispatched");
                }
                self.channel.acknowledge(message).await
            }
            Disposition::Failed => {
                self.record("failed");
                self.channel.acknowledge(message).await
            }
            Disposition::Unacceptable => {
                self.record("unacceptable");
                self.channel.acknowledge(message).await
            }
            Disposition::Requeue(delay) => {
                self.record("requeued");
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                debug!(
                    performer = %self.performer,
                    message_id = %message.id(),
                    delay_ms,
                    "requeueing"
                );
                self.channel.requeue(message.redelivered(delay_ms), delay).await
            }
            Disposition::Reject | Disposition::Stop(_) => {
                self.record("rejected");
                self.channel.reject(message).await
            }
        };
        if let Err(e) = result {
            warn!(performer = %self.performer, message_id = %message.id(), error = %e, "channel settle failed");
        }
    }

    fn record(&self, outcome: &'static str) {
        metrics::counter!(
            "herald_pump_messages_total",
            "subscription" => self.subscription.name.clone(),
            "outcome" => outcome,
        )
        .increment(1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use herald_core::{JsonMessageMapper, MessageBody, MessageHeader, MessageMapper, RequestId};
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::pipeline::{Handler, HandlerRegistration, SubscriberRegistry};
    use crate::processor::MessageMapperRegistry;
    use crate::transport::{InMemoryChannel, InternalBus};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        id: RequestId,
    }

    impl Request for Ping {
        fn id(&self) -> RequestId {
            self.id
        }
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        Fail,
        Defer,
    }

    struct Counting {
        calls: Arc<AtomicU32>,
        outcome: Outcome,
    }

    #[async_trait]
    impl Handler<Ping> for Counting {
        async fn handle(&self, _ping: &mut Ping, _ctx: &RequestContext) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Outcome::Succeed => Ok(()),
                Outcome::Fail => Err(HandlerError::business("downstream unavailable")),
                Outcome::Defer => Err(HandlerError::defer()),
            }
        }
    }

    struct Harness {
        bus: Arc<InternalBus>,
        calls: Arc<AtomicU32>,
        processor: Arc<CommandProcessor>,
    }

    impl Harness {
        fn new(outcome: Outcome, with_mapper: bool) -> Self {
            let calls = Arc::new(AtomicU32::new(0));
            let subscribers = SubscriberRegistry::new();
            subscribers.register(HandlerRegistration::singleton(
                "ping",
                Counting {
                    calls: calls.clone(),
                    outcome,
                },
            ));
            let mappers = MessageMapperRegistry::new();
            if with_mapper {
                mappers.register::<Ping, _>(JsonMessageMapper::command("ping"));
            }
            let processor = CommandProcessor::builder()
                .subscribers(Arc::new(subscribers))
                .mappers(Arc::new(mappers))
                .build()
                .unwrap();
            Self {
                bus: Arc::new(InternalBus::new()),
                calls,
                processor: Arc::new(processor),
            }
        }

        fn pump(&self, subscription: Subscription) -> MessagePump<Ping> {
            let channel = Arc::new(InMemoryChannel::new(
                "ping",
                "ping",
                self.bus.clone(),
                true,
            ));
            MessagePump::new(
                self.processor.clone(),
                channel,
                Arc::new(subscription),
                "ping-0",
            )
        }

        fn enqueue_ping(&self) {
            let message = JsonMessageMapper::<Ping>::command("ping")
                .map_to_message(&Ping { id: RequestId::new() })
                .unwrap();
            self.bus.enqueue("ping", message);
        }

        fn enqueue_garbage(&self) {
            self.bus.enqueue(
                "ping",
                Message::new(
                    MessageHeader::new("ping", MessageType::Command),
                    MessageBody::new("not json", "application/json"),
                ),
            );
        }

        fn quit(&self) {
            self.bus.enqueue("ping", Message::quit());
        }
    }

    type Outcomes = Arc<Mutex<Vec<String>>>;

    /// Collects the `outcome` label of every pump counter increment.
    #[derive(Default)]
    struct OutcomeRecorder {
        outcomes: Outcomes,
    }

    struct OutcomeCounter {
        outcome: String,
        outcomes: Outcomes,
    }

    impl CounterFn for OutcomeCounter {
        fn increment(&self, value: u64) {
            let mut outcomes = self.outcomes.lock();
            for _ in 0..value {
                outcomes.push(self.outcome.clone());
            }
        }

        fn absolute(&self, _value: u64) {}
    }

    impl Recorder for OutcomeRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
            let outcome = key
                .labels()
                .find(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .unwrap_or_default();
            Counter::from_arc(Arc::new(OutcomeCounter {
                outcome,
                outcomes: self.outcomes.clone(),
            }))
        }

        fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    fn subscription() -> Subscription {
        Subscription::new("ping", "ping", "ping")
            .with_timeout(Duration::from_millis(10))
            .with_empty_channel_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn dispatches_until_quit() {
        let harness = Harness::new(Outcome::Succeed, true);
        harness.enqueue_ping();
        harness.enqueue_ping();
        harness.quit();

        let pump = harness.pump(subscription());
        let state = pump.state_handle();
        assert_eq!(**state.load(), ConsumerState::Running);

        assert_eq!(pump.run().await, PumpExit::Quit);
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert_eq!(**state.load(), ConsumerState::Stopped);
        assert_eq!(harness.bus.stream_len("ping"), 0);
    }

    #[tokio::test]
    async fn failed_handler_acknowledges_and_continues() {
        let harness = Harness::new(Outcome::Fail, true);
        harness.enqueue_ping();
        harness.enqueue_ping();
        harness.quit();

        assert_eq!(harness.pump(subscription()).run().await, PumpExit::Quit);
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert!(harness.bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn deferred_message_is_requeued_up_to_limit_then_rejected() {
        let harness = Harness::new(Outcome::Defer, true);
        harness.enqueue_ping();

        let pump = harness.pump(subscription().with_requeue_count(2));
        let running = tokio::spawn(pump.run());

        let bus = harness.bus.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while bus.dead_letters().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        harness.quit();

        assert_eq!(running.await.unwrap(), PumpExit::Quit);
        // First delivery plus two redeliveries.
        assert_eq!(harness.calls.load(Ordering::SeqCst), 3);
        let dead = harness.bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header.handled_count, 2);
    }

    #[tokio::test]
    async fn unacceptable_limit_stops_the_loop() {
        let harness = Harness::new(Outcome::Succeed, true);
        harness.enqueue_garbage();
        harness.enqueue_garbage();
        harness.enqueue_ping();

        let pump = harness.pump(subscription().with_unacceptable_message_limit(2));
        assert_eq!(pump.run().await, PumpExit::UnacceptableLimit);
        assert_eq!(harness.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.bus.stream_len("ping"), 1);
    }

    #[tokio::test]
    async fn successful_dispatch_resets_unacceptable_count() {
        let harness = Harness::new(Outcome::Succeed, true);
        harness.enqueue_garbage();
        harness.enqueue_ping();
        harness.enqueue_garbage();
        harness.quit();

        let pump = harness.pump(subscription().with_unacceptable_message_limit(2));
        assert_eq!(pump.run().await, PumpExit::Quit);
        assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_mapper_rejects_and_stops() {
        let harness = Harness::new(Outcome::Succeed, false);
        harness.enqueue_ping();
        harness.quit();

        assert_eq!(
            harness.pump(subscription()).run().await,
            PumpExit::Configuration
        );
        assert_eq!(harness.bus.dead_letters().len(), 1);
        assert_eq!(harness.bus.stream_len("ping"), 1);
    }

    #[tokio::test]
    async fn each_message_is_counted_under_one_outcome() {
        let recorder = OutcomeRecorder::default();
        let outcomes = recorder.outcomes.clone();
        // The test runtime is single-threaded, so the thread-local recorder sees the pump.
        let _guard = metrics::set_default_local_recorder(&recorder);

        let harness = Harness::new(Outcome::Fail, true);
        harness.enqueue_ping();
        harness.enqueue_garbage();
        harness.quit();
        assert_eq!(harness.pump(subscription()).run().await, PumpExit::Quit);

        let ok = Harness::new(Outcome::Succeed, true);
        ok.enqueue_ping();
        ok.quit();
        assert_eq!(ok.pump(subscription()).run().await, PumpExit::Quit);

        assert_eq!(
            *outcomes.lock(),
            vec!["failed", "unacceptable", "dispatched"]
        );
    }
}
