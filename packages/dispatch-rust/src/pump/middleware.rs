//! Tower stack a delivery runs through on its way into the processor.
//!
//! `DeliveryTrace -> HandlerTimeout -> GlobalConcurrencyLimit -> ProcessorService`,
//! with the timeout and the limit present only when configured.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use courier_core::{Message, RequestContext};
use tokio::sync::Semaphore;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceBuilder};
use tracing::{info_span, Instrument};

use super::subscription::Subscription;
use crate::error::DispatchError;
use crate::processor::CommandProcessor;

type DeliveryFuture = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send>>;

/// Boxed delivery stack held by a pump.
pub type DeliveryService = BoxCloneService<Delivery, (), DispatchError>;

/// One received message on its way to the processor.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Request type the message decodes as.
    pub request_type: &'static str,
    pub message: Message,
    pub ctx: RequestContext,
}

// ---------------------------------------------------------------------------
// ProcessorService
// ---------------------------------------------------------------------------

/// Innermost service: hands the delivery to [`CommandProcessor::dispatch_message`].
#[derive(Clone)]
pub struct ProcessorService {
    processor: Arc<CommandProcessor>,
}

impl ProcessorService {
    #[must_use]
    pub fn new(processor: Arc<CommandProcessor>) -> Self {
        Self { processor }
    }
}

impl Service<Delivery> for ProcessorService {
    type Response = ();
    type Error = DispatchError;
    type Future = DeliveryFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let processor = Arc::clone(&self.processor);
        Box::pin(async move {
            processor
                .dispatch_message(delivery.request_type, delivery.message, delivery.ctx)
                .await
        })
    }
}

// ---------------------------------------------------------------------------
// DeliveryTraceLayer
// ---------------------------------------------------------------------------

/// Runs each delivery inside a `delivery` span and records its duration and result.
#[derive(Debug, Clone)]
pub struct DeliveryTraceLayer {
    channel: Arc<str>,
}

impl DeliveryTraceLayer {
    #[must_use]
    pub fn new(channel: &str) -> Self {
        Self {
            channel: Arc::from(channel),
        }
    }
}

impl<S> Layer<S> for DeliveryTraceLayer {
    type Service = DeliveryTraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeliveryTraceService {
            inner,
            channel: Arc::clone(&self.channel),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryTraceService<S> {
    inner: S,
    channel: Arc<str>,
}

impl<S> Service<Delivery> for DeliveryTraceService<S>
where
    S: Service<Delivery, Response = (), Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = DispatchError;
    type Future = DeliveryFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let span = info_span!(
            parent: &delivery.ctx.span,
            "delivery",
            channel = %self.channel,
            message_id = %delivery.message.id(),
            request_type = delivery.request_type,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let fut = self.inner.call(delivery);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = match &result {
                    Ok(()) => "ok",
                    Err(e) => e.kind(),
                };
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "delivery complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// HandlerTimeoutLayer
// ---------------------------------------------------------------------------

/// Fails a delivery with [`DispatchError::Timeout`] when dispatch takes longer
/// than the limit.
#[derive(Debug, Clone)]
pub struct HandlerTimeoutLayer {
    limit: Duration,
}

impl HandlerTimeoutLayer {
    #[must_use]
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

impl<S> Layer<S> for HandlerTimeoutLayer {
    type Service = HandlerTimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HandlerTimeoutService {
            inner,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerTimeoutService<S> {
    inner: S,
    limit: Duration,
}

impl<S> Service<Delivery> for HandlerTimeoutService<S>
where
    S: Service<Delivery, Response = (), Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = DispatchError;
    type Future = DeliveryFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let limit = self.limit;
        let fut = self.inner.call(delivery);
        Box::pin(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DispatchError::Timeout(limit)),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Stack assembly
// ---------------------------------------------------------------------------

/// Builds the delivery stack for `subscription`.
///
/// `limit` is shared by every Proactor pump of a dispatcher; a delivery waits
/// for a permit when all are taken.
#[must_use]
pub fn build_delivery_service(
    processor: Arc<CommandProcessor>,
    subscription: &Subscription,
    limit: Option<Arc<Semaphore>>,
) -> DeliveryService {
    let service = ServiceBuilder::new()
        .layer(DeliveryTraceLayer::new(&subscription.channel_name))
        .option_layer(subscription.handler_timeout.map(HandlerTimeoutLayer::new))
        .option_layer(limit.map(GlobalConcurrencyLimitLayer::with_semaphore))
        .service(ProcessorService::new(processor));
    BoxCloneService::new(service)
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    /// Succeeds after a configurable delay.
    #[derive(Clone)]
    struct SleepyService {
        delay: Duration,
    }

    impl Service<Delivery> for SleepyService {
        type Response = ();
        type Error = DispatchError;
        type Future = DeliveryFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _delivery: Delivery) -> Self::Future {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    fn delivery() -> Delivery {
        Delivery {
            request_type: "test",
            message: Message::empty(),
            ctx: RequestContext::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_layer_fails_slow_deliveries() {
        let svc = HandlerTimeoutLayer::new(Duration::from_millis(50)).layer(SleepyService {
            delay: Duration::from_millis(200),
        });
        let err = svc.oneshot(delivery()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(limit) if limit == Duration::from_millis(50)));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_layer_passes_fast_deliveries() {
        let svc = HandlerTimeoutLayer::new(Duration::from_millis(50)).layer(SleepyService {
            delay: Duration::from_millis(10),
        });
        svc.oneshot(delivery()).await.unwrap();
    }

    #[tokio::test]
    async fn trace_layer_passes_the_result_through() {
        let svc = DeliveryTraceLayer::new("orders").layer(SleepyService {
            delay: Duration::ZERO,
        });
        svc.oneshot(delivery()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_makes_deliveries_wait() {
        let semaphore = Arc::new(Semaphore::new(1));
        let svc = ServiceBuilder::new()
            .layer(GlobalConcurrencyLimitLayer::with_semaphore(Arc::clone(&semaphore)))
            .service(SleepyService {
                delay: Duration::from_millis(100),
            });

        let start = tokio::time::Instant::now();
        let first = tokio::spawn(svc.clone().oneshot(delivery()));
        let second = tokio::spawn(svc.oneshot(delivery()));
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
