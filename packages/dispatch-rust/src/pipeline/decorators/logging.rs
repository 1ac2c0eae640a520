//! Request logging decorator: logs the request as JSON and continues.

use std::any::type_name;

use async_trait::async_trait;
use courier_core::{Request, RequestContext};

use crate::error::DispatchError;
use crate::pipeline::{Decorator, DecoratorDescriptor, Next, Timing};

pub const NAME: &str = "request_logging";

#[derive(Debug, Clone, Copy)]
pub struct RequestLoggingDecorator {
    timing: Timing,
}

#[async_trait]
impl<R: Request> Decorator<R> for RequestLoggingDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        let body = serde_json::to_string(request).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        tracing::info!(
            parent: &ctx.span,
            request_type = type_name::<R>(),
            request_id = %request.id(),
            timing = ?self.timing,
            request = %body,
            "logging request"
        );
        next.run(request, ctx).await
    }
}

pub fn descriptor<R: Request>(step: u32, timing: Timing) -> DecoratorDescriptor<R> {
    DecoratorDescriptor::from_fn(step, timing, NAME, move || RequestLoggingDecorator { timing })
}
