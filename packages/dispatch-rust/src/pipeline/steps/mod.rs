//! Built-in pipeline steps.
//!
//! Policy steps (retry, circuit breaker, timeout) live in [`crate::policy`].

mod handler;
mod inbox;
mod logging;
mod middleware;

pub use handler::{HandlerService, Terminus};
pub use inbox::{InboxLayer, InboxService};
pub use logging::{RequestLoggingLayer, RequestLoggingService};
pub use middleware::{MiddlewareLayer, MiddlewareService};
