use std::sync::Arc;

use super::{CommandProcessor, MessageMapperRegistry};
use crate::config::ProcessorConfig;
use crate::error::ConfigurationError;
use crate::outbox::{InMemoryOutbox, OutboxRelay};
use crate::pipeline::SubscriberRegistry;
use crate::policy::PolicyRegistry;
use crate::traits::{ChannelFactory, Inbox, Outbox};
use crate::transport::ProducerRegistry;

/// Assembles a [`CommandProcessor`] from its registries and collaborators.
///
/// Unset registries start empty; the outbox defaults to an [`InMemoryOutbox`].
#[derive(Default)]
pub struct CommandProcessorBuilder {
    subscribers: Option<Arc<SubscriberRegistry>>,
    policies: Option<Arc<PolicyRegistry>>,
    mappers: Option<Arc<MessageMapperRegistry>>,
    producers: Option<Arc<ProducerRegistry>>,
    outbox: Option<Arc<dyn Outbox>>,
    inbox: Option<Arc<dyn Inbox>>,
    reply_channels: Option<Arc<dyn ChannelFactory>>,
    config: ProcessorConfig,
}

impl CommandProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscribers(mut self, registry: Arc<SubscriberRegistry>) -> Self {
        self.subscribers = Some(registry);
        self
    }

    #[must_use]
    pub fn policies(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(registry);
        self
    }

    #[must_use]
    pub fn mappers(mut self, registry: Arc<MessageMapperRegistry>) -> Self {
        self.mappers = Some(registry);
        self
    }

    #[must_use]
    pub fn producers(mut self, registry: Arc<ProducerRegistry>) -> Self {
        self.producers = Some(registry);
        self
    }

    #[must_use]
    pub fn outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    #[must_use]
    pub fn inbox(mut self, inbox: Arc<dyn Inbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Channel factory used by `call` to open ephemeral reply channels.
    #[must_use]
    pub fn reply_channels(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.reply_channels = Some(factory);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidTimeout`] if the default call timeout is zero, or
    /// [`ConfigurationError::MissingInbox`] if a global inbox is configured without an inbox.
    pub fn build(self) -> Result<CommandProcessor, ConfigurationError> {
        if self.config.default_call_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidTimeout);
        }
        if self.config.inbox.is_some() && self.inbox.is_none() {
            return Err(ConfigurationError::MissingInbox {
                handler: "*".to_string(),
            });
        }

        let producers = self.producers.unwrap_or_default();
        let outbox = self
            .outbox
            .unwrap_or_else(|| Arc::new(InMemoryOutbox::new()) as Arc<dyn Outbox>);
        let relay = Arc::new(OutboxRelay::new(
            outbox,
            Arc::clone(&producers),
            self.config.outbox_claim_lease(),
        ));

        Ok(CommandProcessor {
            subscribers: self.subscribers.unwrap_or_default(),
            policies: self.policies.unwrap_or_default(),
            mappers: self.mappers.unwrap_or_default(),
            producers,
            relay,
            inbox: self.inbox,
            reply_channels: self.reply_channels,
            config: self.config,
        })
    }
}
