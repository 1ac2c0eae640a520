//! Retry decorator: re-runs the rest of the chain under a named retry policy.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Request, RequestContext};

use crate::error::DispatchError;
use crate::pipeline::{Decorator, DecoratorDescriptor, Next, Timing};
use crate::policy::RetryPolicy;

pub const NAME: &str = "retry";

#[derive(Debug, Clone)]
pub struct RetryDecorator {
    policy: Arc<RetryPolicy>,
}

impl RetryDecorator {
    #[must_use]
    pub fn new(policy: Arc<RetryPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl<R: Request> Decorator<R> for RetryDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        self.policy
            .execute(|attempt| {
                if attempt > 0 {
                    tracing::info!(request_id = %request.id(), attempt, "retrying handler");
                }
                next.run(request, ctx)
            })
            .await
    }
}

/// Descriptor resolving `policy` from the policy registry when the chain is built.
pub fn descriptor<R: Request>(step: u32, policy: String) -> DecoratorDescriptor<R> {
    DecoratorDescriptor::new(step, Timing::Before, NAME, move |services| {
        let retry = services.policies.retry(&policy)?;
        Ok(Arc::new(RetryDecorator::new(retry)) as Arc<dyn Decorator<R>>)
    })
}
