//! Producer routing and the in-process reference transport.

mod internal_bus;

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ConfigurationError;
use crate::traits::Producer;

pub use internal_bus::{InMemoryChannel, InMemoryChannelFactory, InMemoryProducer, InternalBus};

/// Maps topics to the producer that publishes them.
///
/// A default producer, when set, serves every topic without an explicit entry.
#[derive(Default)]
pub struct ProducerRegistry {
    by_topic: DashMap<String, Arc<dyn Producer>>,
    fallback: Option<Arc<dyn Producer>>,
}

impl ProducerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry where one producer serves every topic.
    #[must_use]
    pub fn single(producer: Arc<dyn Producer>) -> Self {
        Self {
            by_topic: DashMap::new(),
            fallback: Some(producer),
        }
    }

    pub fn register(&self, topic: impl Into<String>, producer: Arc<dyn Producer>) {
        self.by_topic.insert(topic.into(), producer);
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingProducer`] if no producer serves `topic`.
    pub fn lookup(&self, topic: &str) -> Result<Arc<dyn Producer>, ConfigurationError> {
        self.by_topic
            .get(topic)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| ConfigurationError::MissingProducer {
                topic: topic.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_topic_wins_over_fallback() {
        let bus = Arc::new(InternalBus::new());
        let fallback = Arc::new(InMemoryProducer::new(bus.clone()));
        let orders = Arc::new(InMemoryProducer::new(bus));
        let registry = ProducerRegistry::single(fallback.clone());
        registry.register("orders", orders.clone());

        let found = registry.lookup("orders").unwrap();
        assert!(Arc::ptr_eq(&found, &(orders as Arc<dyn Producer>)));
        let found = registry.lookup("anything").unwrap();
        assert!(Arc::ptr_eq(&found, &(fallback as Arc<dyn Producer>)));
    }

    #[test]
    fn unknown_topic_without_fallback_is_configuration_error() {
        let registry = ProducerRegistry::new();
        assert!(matches!(
            registry.lookup("orders"),
            Err(ConfigurationError::MissingProducer { .. })
        ));
    }
}
