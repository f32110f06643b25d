//! Herald Dispatch: in-process command processing with handler pipelines, resiliency
//! policies, a transactional outbox, an idempotent inbox and a message pump.
//!
//! The [`CommandProcessor`] is the entry point: `send` and `publish` dispatch in-process
//! through pipelines built per call, `post`, `deposit_post` and `clear_outbox` move messages
//! through the outbox, and `call`/`reply` implement request/reply over a transport. The
//! [`Dispatcher`] runs [`MessagePump`] performers that feed transport messages back into a
//! processor.

pub mod config;
pub mod error;
pub mod inbox;
pub mod lock;
pub mod outbox;
pub mod pipeline;
pub mod policy;
pub mod processor;
pub mod pump;
pub mod telemetry;
pub mod traits;
pub mod transport;

pub use config::{ProcessorConfig, SweeperConfig};
pub use error::{
    ConfigurationError, DispatcherError, HandlerError, LockError, StoreError, TransportError,
};
pub use inbox::{InMemoryInbox, InboxConfiguration, InboxRecord, OnceOnlyAction};
pub use lock::{InMemoryLock, LockToken};
pub use outbox::{
    InMemoryOutbox, OutboxEntry, OutboxRelay, OutboxSweeper, OutboxTransaction,
    TimedOutboxSweeper,
};
pub use pipeline::{
    Envelope, Handler, HandlerRegistration, Middleware, MiddlewareRegistration, Next,
    StepDescriptor, StepKind, SubscriberRegistry, Timing,
};
pub use policy::{CircuitBreakerPolicy, PolicyKind, PolicyRegistry, RetryPolicy};
pub use processor::{CommandProcessor, CommandProcessorBuilder, MessageMapperRegistry};
pub use pump::{ConsumerInfo, ConsumerState, Dispatcher, DispatcherState, MessagePump, Subscription};
pub use traits::{Channel, ChannelFactory, DistributedLock, Inbox, Outbox, Producer};
pub use transport::{InMemoryChannelFactory, InMemoryProducer, InternalBus, ProducerRegistry};
