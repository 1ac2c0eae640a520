//! Circuit breaker decorator: guards the rest of the chain with a shared breaker.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Request, RequestContext};

use crate::error::DispatchError;
use crate::pipeline::{Decorator, DecoratorDescriptor, Next, Timing};
use crate::policy::CircuitBreaker;

pub const NAME: &str = "circuit_breaker";

#[derive(Debug, Clone)]
pub struct CircuitBreakerDecorator {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerDecorator {
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl<R: Request> Decorator<R> for CircuitBreakerDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        self.breaker.execute(next.run(request, ctx)).await
    }
}

pub fn descriptor<R: Request>(step: u32, policy: String) -> DecoratorDescriptor<R> {
    DecoratorDescriptor::new(step, Timing::Before, NAME, move |services| {
        let breaker = services.policies.circuit_breaker(&policy)?;
        Ok(Arc::new(CircuitBreakerDecorator::new(breaker)) as Arc<dyn Decorator<R>>)
    })
}
