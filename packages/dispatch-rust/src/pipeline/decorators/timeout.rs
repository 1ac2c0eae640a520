//! Timeout decorator.
//!
//! Fails the rest of the chain with `DispatchError::Timeout` when it runs past
//! its limit. The abandoned handler future is dropped at that point, so the
//! handler stops at its next await.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::{Request, RequestContext};

use crate::error::DispatchError;
use crate::pipeline::{Decorator, DecoratorDescriptor, Next, Timing};

pub const NAME: &str = "timeout";

#[derive(Debug, Clone, Copy)]
pub struct TimeoutDecorator {
    limit: Duration,
}

impl TimeoutDecorator {
    #[must_use]
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl<R: Request> Decorator<R> for TimeoutDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        match tokio::time::timeout(self.limit, next.run(request, ctx)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    request_id = %request.id(),
                    limit_ms = u64::try_from(self.limit.as_millis()).unwrap_or(u64::MAX),
                    "handler timed out"
                );
                Err(DispatchError::Timeout(self.limit))
            }
        }
    }
}

pub fn descriptor<R: Request>(step: u32, limit: Duration) -> DecoratorDescriptor<R> {
    DecoratorDescriptor::from_fn(step, Timing::Before, NAME, move || TimeoutDecorator::new(limit))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::DispatchError;
    use crate::handler::HandlerRegistration;
    use crate::test_support::{pipeline_for, Ping, PingHandler, SlowHandler};

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let pipeline = pipeline_for(
            HandlerRegistration::<Ping>::new::<SlowHandler>().with_timeout(0, Duration::from_millis(50)),
        );
        let err = pipeline
            .dispatch(&Ping::new("slow"), &Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(d) if d == Duration::from_millis(50)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn fast_handler_passes() {
        let pipeline = pipeline_for(
            HandlerRegistration::<Ping>::new::<PingHandler>().with_timeout(0, Duration::from_secs(5)),
        );
        assert!(pipeline.dispatch(&Ping::new("fast"), &Default::default()).await.is_ok());
    }
}
