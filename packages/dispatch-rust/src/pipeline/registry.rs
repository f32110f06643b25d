use std::any::{Any, TypeId};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use herald_core::Request;

use super::descriptor::StepDescriptor;
use super::scope::{HandlerFactory, Lifetime};
use super::{Handler, Middleware};

// ---------------------------------------------------------------------------
// HandlerRegistration
// ---------------------------------------------------------------------------

/// A business handler for `R` together with the steps that wrap it.
pub struct HandlerRegistration<R: Request> {
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn HandlerFactory<dyn Handler<R>>>,
    pub(crate) lifetime: Lifetime,
    pub(crate) singleton: OnceLock<Arc<dyn Handler<R>>>,
    pub(crate) steps: Vec<StepDescriptor>,
    pub(crate) global_inbox: bool,
}

impl<R: Request> HandlerRegistration<R> {
    /// Registers a factory-produced handler with an explicit lifetime.
    pub fn with_factory(
        name: impl Into<String>,
        factory: impl HandlerFactory<dyn Handler<R>> + 'static,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            lifetime,
            singleton: OnceLock::new(),
            steps: Vec::new(),
            global_inbox: true,
        }
    }

    /// Registers one shared handler instance.
    pub fn singleton<H>(name: impl Into<String>, handler: H) -> Self
    where
        H: Handler<R> + 'static,
    {
        let handler: Arc<dyn Handler<R>> = Arc::new(handler);
        Self::with_factory(name, move || Arc::clone(&handler), Lifetime::Singleton)
    }

    /// Registers a handler built fresh for every pipeline.
    pub fn transient<H, F>(name: impl Into<String>, make: F) -> Self
    where
        H: Handler<R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self::with_factory(
            name,
            move || Arc::new(make()) as Arc<dyn Handler<R>>,
            Lifetime::Transient,
        )
    }

    /// Adds a pipeline step.
    #[must_use]
    pub fn step(mut self, descriptor: StepDescriptor) -> Self {
        self.steps.push(descriptor);
        self
    }

    /// Excludes this handler from the processor-wide inbox step.
    #[must_use]
    pub fn without_global_inbox(mut self) -> Self {
        self.global_inbox = false;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// MiddlewareRegistration
// ---------------------------------------------------------------------------

/// A named custom step for `R`.
pub struct MiddlewareRegistration<R: Request> {
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn HandlerFactory<dyn Middleware<R>>>,
    pub(crate) lifetime: Lifetime,
    pub(crate) singleton: OnceLock<Arc<dyn Middleware<R>>>,
}

impl<R: Request> MiddlewareRegistration<R> {
    pub fn with_factory(
        name: impl Into<String>,
        factory: impl HandlerFactory<dyn Middleware<R>> + 'static,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            lifetime,
            singleton: OnceLock::new(),
        }
    }

    pub fn singleton<M>(name: impl Into<String>, middleware: M) -> Self
    where
        M: Middleware<R> + 'static,
    {
        let middleware: Arc<dyn Middleware<R>> = Arc::new(middleware);
        Self::with_factory(name, move || Arc::clone(&middleware), Lifetime::Singleton)
    }
}

// ---------------------------------------------------------------------------
// SubscriberRegistry
// ---------------------------------------------------------------------------

type HandlerList<R> = Vec<Arc<HandlerRegistration<R>>>;

/// Typed lookup from request type to its handlers and named middleware.
///
/// Populated explicitly at startup; keyed by `TypeId` so no runtime scanning is needed.
#[derive(Default)]
pub struct SubscriberRegistry {
    /// `TypeId` of `R` -> `HandlerList<R>`.
    handlers: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
    /// `(TypeId` of `R`, name) -> `Arc<MiddlewareRegistration<R>>`.
    middleware: DashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `R`. Handlers keep registration order.
    pub fn register<R: Request>(&self, registration: HandlerRegistration<R>) {
        let mut entry = self
            .handlers
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(HandlerList::<R>::new()));
        if let Some(list) = entry.value_mut().downcast_mut::<HandlerList<R>>() {
            list.push(Arc::new(registration));
        }
    }

    /// Handlers registered for `R`, in registration order.
    #[must_use]
    pub fn handlers_for<R: Request>(&self) -> HandlerList<R> {
        self.handlers
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.value().downcast_ref::<HandlerList<R>>().cloned())
            .unwrap_or_default()
    }

    pub fn register_middleware<R: Request>(&self, registration: MiddlewareRegistration<R>) {
        let key = (TypeId::of::<R>(), registration.name.clone());
        self.middleware.insert(key, Arc::new(registration));
    }

    #[must_use]
    pub fn middleware_for<R: Request>(&self, name: &str) -> Option<Arc<MiddlewareRegistration<R>>> {
        self.middleware
            .get(&(TypeId::of::<R>(), name.to_string()))
            .and_then(|entry| {
                Arc::clone(entry.value())
                    .downcast::<MiddlewareRegistration<R>>()
                    .ok()
            })
    }

    /// Removes every registration. Intended for test teardown.
    pub fn clear(&self) {
        self.handlers.clear();
        self.middleware.clear();
    }
}
