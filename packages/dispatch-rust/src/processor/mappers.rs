use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use herald_core::{MessageMapper, Request};

use crate::error::ConfigurationError;

/// Typed lookup from request type to its message mapper.
#[derive(Default)]
pub struct MessageMapperRegistry {
    /// `TypeId` of `R` -> `Arc<dyn MessageMapper<R>>`.
    mappers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl MessageMapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the mapper for `R`, e.g.
    /// `mappers.register::<OrderPlaced, _>(JsonMessageMapper::event("orders"))`.
    pub fn register<R, M>(&self, mapper: M)
    where
        R: Request,
        M: MessageMapper<R> + 'static,
    {
        let mapper: Arc<dyn MessageMapper<R>> = Arc::new(mapper);
        self.mappers.insert(TypeId::of::<R>(), Arc::new(mapper));
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingMapper`] if no mapper is registered for `R`.
    pub fn get<R: Request>(&self) -> Result<Arc<dyn MessageMapper<R>>, ConfigurationError> {
        self.mappers
            .get(&TypeId::of::<R>())
            .and_then(|entry| {
                entry
                    .value()
                    .downcast_ref::<Arc<dyn MessageMapper<R>>>()
                    .cloned()
            })
            .ok_or(ConfigurationError::MissingMapper {
                request_type: R::request_type(),
            })
    }

    #[must_use]
    pub fn contains<R: Request>(&self) -> bool {
        self.mappers.contains_key(&TypeId::of::<R>())
    }

    /// Removes every mapper. Intended for test teardown.
    pub fn clear(&self) {
        self.mappers.clear();
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{JsonMessageMapper, RequestId};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Shipped {
        id: RequestId,
    }

    impl Request for Shipped {
        fn id(&self) -> RequestId {
            self.id
        }
    }

    #[test]
    fn registered_mapper_round_trips() {
        let registry = MessageMapperRegistry::new();
        registry.register::<Shipped, _>(JsonMessageMapper::event("shipping"));

        let mapper = registry.get::<Shipped>().unwrap();
        let shipped = Shipped { id: RequestId::new() };
        let message = mapper.map_to_message(&shipped).unwrap();
        assert_eq!(message.header.topic, "shipping");
        assert_eq!(mapper.map_to_request(&message).unwrap().id, shipped.id);
    }

    #[test]
    fn missing_mapper_is_a_configuration_error() {
        let registry = MessageMapperRegistry::new();
        let err = registry.get::<Shipped>().err().unwrap();
        assert!(matches!(err, ConfigurationError::MissingMapper { .. }));
        assert!(!registry.contains::<Shipped>());
    }
}
