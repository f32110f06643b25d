//! Named resiliency policies applied around pipeline steps.
//!
//! Policies are registered by name in a [`PolicyRegistry`] and referenced from pipelines with
//! [`StepKind::UsePolicy`](crate::pipeline::StepKind::UsePolicy). A pipeline that names an
//! unregistered policy fails to build.

mod circuit_breaker;
mod retry;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use herald_core::Request;
use tower::util::BoxCloneService;
use tower::Layer;

use crate::error::ConfigurationError;
use crate::pipeline::{StepService, Stragglers};

pub use circuit_breaker::{
    CircuitBreakerLayer, CircuitBreakerPolicy, CircuitBreakerService, CircuitState,
};
pub use retry::{RetryLayer, RetryPolicy, RetryService};
pub use timeout::{TimeoutLayer, TimeoutService};

/// The behaviour of a named policy.
#[derive(Debug, Clone)]
pub enum PolicyKind {
    Retry(RetryPolicy),
    /// Breaker state is shared by every pipeline that uses the policy.
    CircuitBreaker(CircuitBreakerPolicy),
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub kind: PolicyKind,
}

impl Policy {
    /// Wraps `inner` with this policy. Timeouts report abandoned work to `stragglers`.
    pub(crate) fn wrap<R: Request>(
        &self,
        inner: StepService<R>,
        stragglers: &Stragglers,
    ) -> StepService<R> {
        match &self.kind {
            PolicyKind::Retry(retry) => {
                BoxCloneService::new(RetryLayer::new(&self.name, retry.clone()).layer(inner))
            }
            PolicyKind::CircuitBreaker(breaker) => BoxCloneService::new(
                CircuitBreakerLayer::new(&self.name, breaker.clone()).layer(inner),
            ),
            PolicyKind::Timeout(duration) => BoxCloneService::new(
                TimeoutLayer::new(*duration)
                    .reporting_to(stragglers.clone())
                    .layer(inner),
            ),
        }
    }
}

/// Name to policy lookup, populated at startup.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: DashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a policy.
    pub fn register(&self, name: impl Into<String>, kind: PolicyKind) {
        let name = name.into();
        self.policies
            .insert(name.clone(), Arc::new(Policy { name, kind }));
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingPolicy`] if `name` was never registered.
    pub fn get(&self, name: &str) -> Result<Arc<Policy>, ConfigurationError> {
        self.policies
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigurationError::MissingPolicy {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}
