//! Links registered step descriptors into runnable [`Pipeline`]s.

use std::sync::Arc;

use herald_core::Request;
use tower::util::BoxCloneService;
use tower::Layer;
use tracing::debug;

use super::descriptor::{order_steps, StepDescriptor, StepKind};
use super::registry::{HandlerRegistration, SubscriberRegistry};
use super::scope::HandlerScope;
use super::steps::{
    HandlerService, InboxLayer, MiddlewareLayer, RequestLoggingLayer, Terminus,
};
use super::{Pipeline, StepService};
use crate::error::{ConfigurationError, HandlerError};
use crate::inbox::InboxConfiguration;
use crate::policy::{PolicyRegistry, TimeoutLayer};
use crate::traits::Inbox;

/// Builds one pipeline per registered handler of a request type.
///
/// Building is cheap and happens per dispatch so that transient and scoped instances are
/// created fresh and released when the pipeline finishes.
pub struct PipelineBuilder<'a> {
    registry: &'a SubscriberRegistry,
    policies: &'a PolicyRegistry,
    inbox: Option<&'a Arc<dyn Inbox>>,
    global_inbox: Option<&'a InboxConfiguration>,
}

impl<'a> PipelineBuilder<'a> {
    #[must_use]
    pub fn new(registry: &'a SubscriberRegistry, policies: &'a PolicyRegistry) -> Self {
        Self {
            registry,
            policies,
            inbox: None,
            global_inbox: None,
        }
    }

    /// Inbox used by `UseInbox` steps and by the global inbox configuration.
    #[must_use]
    pub fn with_inbox(mut self, inbox: Option<&'a Arc<dyn Inbox>>) -> Self {
        self.inbox = inbox;
        self
    }

    /// Adds an inbox step as the outermost step of every pipeline that does not declare one.
    #[must_use]
    pub fn with_global_inbox(mut self, config: Option<&'a InboxConfiguration>) -> Self {
        self.global_inbox = config;
        self
    }

    /// Builds a pipeline for every handler registered for `R`, in registration order.
    ///
    /// An empty vector means no handler is registered.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for duplicate step ordinals, unknown policies or
    /// middleware, zero timeouts, or an inbox step without a configured inbox.
    pub fn build<R: Request>(&self) -> Result<Vec<Pipeline<R>>, HandlerError> {
        self.registry
            .handlers_for::<R>()
            .iter()
            .map(|registration| self.build_one(registration))
            .collect()
    }

    fn build_one<R: Request>(
        &self,
        registration: &HandlerRegistration<R>,
    ) -> Result<Pipeline<R>, HandlerError> {
        let (before, after) = order_steps(&registration.name, &registration.steps)?;
        let mut scope = HandlerScope::new();

        let mut service: StepService<R> = BoxCloneService::new(Terminus);
        for descriptor in after.iter().rev() {
            service = self.wrap(&registration.name, descriptor, service, &mut scope)?;
        }

        let handler = scope.resolve(
            &registration.name,
            &registration.factory,
            registration.lifetime,
            &registration.singleton,
        );
        service = BoxCloneService::new(HandlerService::new(handler, service));

        for descriptor in before.iter().rev() {
            service = self.wrap(&registration.name, descriptor, service, &mut scope)?;
        }

        let declares_inbox = registration
            .steps
            .iter()
            .any(|d| matches!(d.kind, StepKind::UseInbox(_)));
        let mut labels = Vec::new();
        if let Some(config) = self.global_inbox {
            if registration.global_inbox && !declares_inbox {
                service = self.inbox_step::<R>(&registration.name, config, service)?;
                labels.push("inbox".to_string());
            }
        }

        labels.extend(before.iter().map(|d| d.kind.label()));
        labels.push(registration.name.clone());
        labels.extend(after.iter().map(|d| d.kind.label()));
        let description = labels.join(" -> ");
        debug!(
            request_type = R::request_type(),
            pipeline = %description,
            "pipeline built"
        );

        Ok(Pipeline {
            handler: registration.name.clone(),
            description,
            service,
            scope,
        })
    }

    fn wrap<R: Request>(
        &self,
        handler: &str,
        descriptor: &StepDescriptor,
        inner: StepService<R>,
        scope: &mut HandlerScope,
    ) -> Result<StepService<R>, HandlerError> {
        let service = match &descriptor.kind {
            StepKind::RequestLogging => {
                BoxCloneService::new(RequestLoggingLayer::new(descriptor.timing).layer(inner))
            }
            StepKind::UsePolicy(names) => {
                let policies = names
                    .iter()
                    .map(|name| self.policies.get(name))
                    .collect::<Result<Vec<_>, _>>()?;
                let stragglers = scope.stragglers();
                policies
                    .iter()
                    .rev()
                    .fold(inner, |service, policy| policy.wrap(service, &stragglers))
            }
            StepKind::Timeout(duration) => {
                if duration.is_zero() {
                    return Err(ConfigurationError::InvalidTimeout.into());
                }
                BoxCloneService::new(
                    TimeoutLayer::new(*duration)
                        .reporting_to(scope.stragglers())
                        .layer(inner),
                )
            }
            StepKind::UseInbox(config) => self.inbox_step::<R>(handler, config, inner)?,
            StepKind::Custom(name) => {
                let registration = self.registry.middleware_for::<R>(name).ok_or_else(|| {
                    ConfigurationError::MissingMiddleware {
                        name: name.clone(),
                        request_type: R::request_type(),
                    }
                })?;
                let middleware = scope.resolve(
                    &registration.name,
                    &registration.factory,
                    registration.lifetime,
                    &registration.singleton,
                );
                BoxCloneService::new(MiddlewareLayer::new(middleware).layer(inner))
            }
        };
        Ok(service)
    }

    fn inbox_step<R: Request>(
        &self,
        handler: &str,
        config: &InboxConfiguration,
        inner: StepService<R>,
    ) -> Result<StepService<R>, HandlerError> {
        let inbox = self.inbox.ok_or_else(|| ConfigurationError::MissingInbox {
            handler: handler.to_string(),
        })?;
        let context_key = config
            .context_key
            .clone()
            .unwrap_or_else(|| handler.to_string());
        let layer = InboxLayer::new(Arc::clone(inbox), context_key, config.once_only, config.action);
        Ok(BoxCloneService::new(layer.layer(inner)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
