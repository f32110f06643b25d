//! Herald Core: wire messages, typed requests, request context and message mappers.

pub mod context;
pub mod mapper;
pub mod message;
pub mod request;

pub use context::RequestContext;
pub use mapper::{JsonMessageMapper, MappingError, MessageMapper};
pub use message::{Message, MessageBody, MessageHeader, MessageId, MessageType};
pub use request::{ReplyAddress, Request, RequestId};

pub use tokio_util::sync::CancellationToken;
