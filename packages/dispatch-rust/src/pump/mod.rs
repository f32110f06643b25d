//! Message pump and dispatcher: consumer loops that drive wire messages into the processor.
//!
//! Each [`Subscription`] is served by `no_of_performers` competing [`MessagePump`] loops
//! sharing one channel. The [`Dispatcher`] owns subscriptions and controls their performers.

mod dispatcher;
mod message_pump;
mod subscription;

pub use dispatcher::{ConsumerInfo, Dispatcher, DispatcherState};
pub use message_pump::{MessagePump, PumpExit};
pub use subscription::Subscription;

/// Lifecycle of one performer loop.
///
/// State machine: Running -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    Stopped,
}
