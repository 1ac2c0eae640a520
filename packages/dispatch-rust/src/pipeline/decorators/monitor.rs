//! Monitoring decorator.
//!
//! Records a before event, then the duration and outcome of the rest of the
//! chain. The after event is emitted whether the chain succeeded or failed.

use std::any::type_name;
use std::time::Instant;

use async_trait::async_trait;
use courier_core::{Request, RequestContext};
use tracing::{info_span, Instrument};

use crate::error::DispatchError;
use crate::pipeline::{DecoratorDescriptor, Decorator, Next, Timing};

pub const NAME: &str = "monitor";

/// Times the rest of the chain inside a `monitor` span.
#[derive(Debug, Clone)]
pub struct MonitorDecorator {
    handler: &'static str,
}

impl MonitorDecorator {
    #[must_use]
    pub fn new(handler: &'static str) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<R: Request> Decorator<R> for MonitorDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        let request_type = type_name::<R>();
        let span = info_span!(
            parent: &ctx.span,
            "monitor",
            request_type,
            handler = self.handler,
            request_id = %request.id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            tracing::debug!(request_type, handler = self.handler, "before handler");
            let start = Instant::now();
            let result = next.run(request, ctx).await;
            let elapsed = start.elapsed();

            let outcome = match &result {
                Ok(()) => "ok",
                Err(e) => e.kind(),
            };

            let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            metrics::histogram!(
                "courier_pipeline_duration_seconds",
                "request_type" => request_type,
                "outcome" => outcome,
            )
            .record(elapsed.as_secs_f64());

            match &result {
                Ok(()) => tracing::info!(
                    request_type,
                    handler = self.handler,
                    duration_ms,
                    "after handler"
                ),
                Err(e) => tracing::warn!(
                    request_type,
                    handler = self.handler,
                    duration_ms,
                    error = %e,
                    "after handler, failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Descriptor for a [`MonitorDecorator`] around `handler`.
pub fn descriptor<R: Request>(step: u32, handler: &'static str) -> DecoratorDescriptor<R> {
    DecoratorDescriptor::from_fn(step, Timing::Before, NAME, move || {
        MonitorDecorator::new(handler)
    })
}
