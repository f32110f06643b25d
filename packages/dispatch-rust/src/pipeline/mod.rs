//! Handler pipeline: an ordered chain of steps around one business handler.
//!
//! Each step is a `tower` service over an [`Envelope`]. A pipeline for a handler is built from
//! its registered [`StepDescriptor`]s: before-steps in ascending order, then the business
//! handler, then after-steps in ascending order. Any step may short-circuit by returning
//! without calling the service it wraps.

mod builder;
mod descriptor;
mod registry;
mod scope;
pub mod steps;

use async_trait::async_trait;
use herald_core::{Request, RequestContext};
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tracing::debug;

use crate::error::HandlerError;

pub use builder::PipelineBuilder;
pub use descriptor::{StepDescriptor, StepKind, Timing};
pub use registry::{HandlerRegistration, MiddlewareRegistration, SubscriberRegistry};
pub use scope::{HandlerFactory, HandlerScope, Lifetime};
pub(crate) use scope::Stragglers;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A request travelling through a pipeline together with its dispatch context.
#[derive(Debug, Clone)]
pub struct Envelope<R> {
    pub request: R,
    pub context: RequestContext,
}

impl<R: Request> Envelope<R> {
    #[must_use]
    pub fn new(request: R, context: RequestContext) -> Self {
        Self { request, context }
    }
}

/// Type-erased pipeline step.
pub type StepService<R> = BoxCloneService<Envelope<R>, Envelope<R>, HandlerError>;

// ---------------------------------------------------------------------------
// Handler / Middleware
// ---------------------------------------------------------------------------

/// Business handler for one request type. Terminal node of a pipeline.
#[async_trait]
pub trait Handler<R: Request>: Send + Sync {
    async fn handle(&self, request: &mut R, ctx: &RequestContext) -> Result<(), HandlerError>;
}

/// The rest of the pipeline, handed to a [`Middleware`].
pub struct Next<R> {
    inner: StepService<R>,
}

impl<R: Request> Next<R> {
    pub(crate) fn new(inner: StepService<R>) -> Self {
        Self { inner }
    }

    /// Runs the remaining steps.
    ///
    /// # Errors
    ///
    /// Returns whatever error a downstream step raises.
    pub async fn run(self, envelope: Envelope<R>) -> Result<Envelope<R>, HandlerError> {
        self.inner.oneshot(envelope).await
    }
}

/// Custom pipeline step registered by name and referenced with [`StepKind::Custom`].
///
/// Dropping `next` without running it short-circuits the pipeline.
#[async_trait]
pub trait Middleware<R: Request>: Send + Sync {
    async fn handle(&self, envelope: Envelope<R>, next: Next<R>)
        -> Result<Envelope<R>, HandlerError>;
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A fully linked chain for one handler, plus the scope owning its instances.
pub struct Pipeline<R> {
    handler: String,
    description: String,
    service: StepService<R>,
    scope: HandlerScope,
}

impl<R: Request> Pipeline<R> {
    /// Name of the business handler this pipeline terminates in.
    #[must_use]
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Human-readable step order, e.g. `logging -> validation -> place_order`.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Runs the chain. Instances resolved for this pipeline are released when this returns,
    /// whether it succeeds, fails, or is dropped mid-flight.
    ///
    /// After a timeout step gives up, the cancelled downstream work may still be running. In
    /// that case release is deferred to a background task that waits for the work to stop.
    ///
    /// # Errors
    ///
    /// Returns the first error that propagates out of the chain.
    pub async fn run(self, envelope: Envelope<R>) -> Result<Envelope<R>, HandlerError> {
        let Self { service, scope, .. } = self;
        let result = service.oneshot(envelope).await;
        let stragglers = scope.take_stragglers();
        if stragglers.is_empty() {
            drop(scope);
        } else {
            debug!(
                pending = stragglers.len(),
                "deferring release until timed-out work stops"
            );
            tokio::spawn(async move {
                futures_util::future::join_all(stragglers).await;
                drop(scope);
            });
        }
        result
    }
}
