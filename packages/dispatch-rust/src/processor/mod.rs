//! The command processor: in-process dispatch, outbox posting, request/reply,
//! scheduling, and the entry point message pumps dispatch through.

pub mod builder;
pub mod bus;

use std::any::type_name;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use courier_core::{CallRequest, Channel, Id, Message, ReplyAddress, Request, RequestContext};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::ProcessorConfig;
use crate::error::DispatchError;
use crate::mapper::MessageMapperRegistry;
use crate::outbox::ClearReport;
use crate::pipeline::{BoxFuture, DispatchMode, PipelineBuilder};
use crate::pump::{ChannelFactory, Subscription};
use crate::scheduler::{FireJob, RequestScheduler, ScheduleTime, ScheduledFire, SchedulerKind};

pub use builder::CommandProcessorBuilder;
pub use bus::ExternalBus;

/// Reads `channel` until a message correlated with `correlation_id`
/// arrives or `timeout` passes.
async fn await_reply(
    channel: &dyn Channel,
    correlation_id: &Id,
    timeout: Duration,
) -> Result<Message, DispatchError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(DispatchError::Timeout(timeout));
        }
        let received = channel
            .receive(remaining)
            .await
            .map_err(DispatchError::ChannelFailure)?;
        if received.is_empty() {
            continue;
        }
        channel
            .acknowledge(&received)
            .await
            .map_err(DispatchError::ChannelFailure)?;
        if received.header.correlation_id.as_ref() == Some(correlation_id) {
            return Ok(received);
        }
        warn!(
            message_id = %received.id(),
            correlation_id = ?received.header.correlation_id,
            "discarding uncorrelated message on reply topic"
        );
    }
}

/// Routes requests to handler pipelines and messages to the external bus.
///
/// Built by [`CommandProcessorBuilder`] into an `Arc`; scheduled fires hold a
/// weak reference back to it.
pub struct CommandProcessor {
    pipelines: PipelineBuilder,
    mappers: Arc<MessageMapperRegistry>,
    bus: Arc<ExternalBus>,
    scheduler: Option<Arc<dyn RequestScheduler>>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    reply_subscriptions: Vec<Subscription>,
    config: ProcessorConfig,
    me: Weak<CommandProcessor>,
}

fn record_duration<R>(started: Instant, result: &Result<(), DispatchError>) {
    let outcome = match result {
        Ok(()) => "ok",
        Err(e) => e.kind(),
    };
    metrics::histogram!(
        "courier_pipeline_duration_seconds",
        "request_type" => type_name::<R>(),
        "outcome" => outcome
    )
    .record(started.elapsed().as_secs_f64());
}

impl CommandProcessor {
    #[must_use]
    pub fn builder(
        registry: Arc<crate::handler::SubscriberRegistry>,
        factory: Arc<dyn crate::handler::HandlerFactory>,
    ) -> CommandProcessorBuilder {
        CommandProcessorBuilder::new(registry, factory)
    }

    #[must_use]
    pub fn mappers(&self) -> &MessageMapperRegistry {
        &self.mappers
    }

    #[must_use]
    pub fn bus(&self) -> &ExternalBus {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // In-process dispatch
    // -----------------------------------------------------------------------

    /// Dispatches a command to its one handler.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] unless exactly one handler is
    /// registered, and otherwise whatever the pipeline returns.
    pub async fn send<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        self.send_with_context(request, &RequestContext::new()).await
    }

    /// [`send`](Self::send) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_with_context<R: Request>(
        &self,
        request: &R,
        ctx: &RequestContext,
    ) -> Result<(), DispatchError> {
        let span = info_span!(
            parent: &ctx.span,
            "send",
            request_type = type_name::<R>(),
            request_id = %request.id(),
        );
        async {
            let started = Instant::now();
            let result = match self.pipelines.build(request, ctx, DispatchMode::Send) {
                Ok(mut pipelines) => match pipelines.pop() {
                    Some(pipeline) => pipeline.dispatch(request, ctx).await,
                    None => Err(DispatchError::configuration(format!(
                        "no command handler was found for {}",
                        type_name::<R>()
                    ))),
                },
                Err(e) => Err(e),
            };
            record_duration::<R>(started, &result);
            if let Err(e) = &result {
                warn!(error = %e, kind = e.kind(), "send failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Dispatches an event to every subscribed handler, in registration order.
    ///
    /// A failing handler does not stop the ones after it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Aggregate`] holding every handler failure once
    /// all handlers have run.
    pub async fn publish<R: Request>(&self, event: &R) -> Result<(), DispatchError> {
        self.publish_with_context(event, &RequestContext::new()).await
    }

    /// [`publish`](Self::publish) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_with_context<R: Request>(
        &self,
        event: &R,
        ctx: &RequestContext,
    ) -> Result<(), DispatchError> {
        let span = info_span!(
            parent: &ctx.span,
            "publish",
            request_type = type_name::<R>(),
            request_id = %event.id(),
        );
        async {
            let started = Instant::now();
            let pipelines = self.pipelines.build(event, ctx, DispatchMode::Publish)?;
            if pipelines.is_empty() {
                debug!("no handlers subscribed");
            }

            let mut errors = Vec::new();
            for pipeline in &pipelines {
                if let Err(e) = pipeline.dispatch(event, ctx).await {
                    warn!(handler = pipeline.handler().name(), error = %e, "published handler failed");
                    errors.push(e);
                }
            }

            let result = if errors.is_empty() {
                Ok(())
            } else {
                Err(DispatchError::Aggregate(errors))
            };
            record_duration::<R>(started, &result);
            result
        }
        .instrument(span)
        .await
    }

    /// Forgets cached handler plans so later registrations take effect.
    pub fn clear_pipeline_cache(&self) {
        self.pipelines.clear_cache();
    }

    // -----------------------------------------------------------------------
    // External bus
    // -----------------------------------------------------------------------

    /// Deposits `request` in the outbox and clears it straight away.
    ///
    /// The deposit does not join an ambient transaction. A failed send is
    /// logged and left to the sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] without an external bus, and
    /// any deposit failure.
    pub async fn post<R: Request>(&self, request: &R) -> Result<Id, DispatchError> {
        self.post_inner(request, false).await
    }

    /// [`post`](Self::post), but a failed send is returned to the caller.
    ///
    /// # Errors
    ///
    /// As [`post`](Self::post), plus the send failure.
    pub async fn post_confirmed<R: Request>(&self, request: &R) -> Result<Id, DispatchError> {
        self.post_inner(request, true).await
    }

    async fn post_inner<R: Request>(&self, request: &R, confirm: bool) -> Result<Id, DispatchError> {
        let mediator = self.bus.mediator()?;
        let id = mediator.deposit(request, false).await?;
        mediator.clear(std::slice::from_ref(&id), confirm).await?;
        Ok(id)
    }

    /// Deposits `request` in the outbox without sending it, inside the
    /// ambient transaction when one is open.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] without an external bus, and
    /// any deposit failure.
    pub async fn deposit_post<R: Request>(&self, request: &R) -> Result<Id, DispatchError> {
        self.bus.mediator()?.deposit(request, true).await
    }

    /// Deposits every request in `requests`. See [`deposit_post`](Self::deposit_post).
    ///
    /// # Errors
    ///
    /// Fails on the first request that cannot be deposited.
    pub async fn deposit_post_batch<R: Request>(&self, requests: &[R]) -> Result<Vec<Id>, DispatchError> {
        self.bus.mediator()?.deposit_batch(requests, true).await
    }

    /// Sends deposited entries. Send failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::OutboxEntryNotFound`] for an unknown id.
    pub async fn clear_outbox(&self, ids: &[Id]) -> Result<ClearReport, DispatchError> {
        self.bus.mediator()?.clear(ids, false).await
    }

    /// Sends deposited entries and returns send failures.
    ///
    /// # Errors
    ///
    /// As [`clear_outbox`](Self::clear_outbox), plus the send failures.
    pub async fn clear_outbox_confirmed(&self, ids: &[Id]) -> Result<ClearReport, DispatchError> {
        self.bus.mediator()?.clear(ids, true).await
    }

    // -----------------------------------------------------------------------
    // Request/reply
    // -----------------------------------------------------------------------

    /// Sends `request` and waits for its reply.
    ///
    /// Each call reads from its own reply topic, named after the reply
    /// subscription's routing key plus a fresh id, so concurrent calls never
    /// see each other's replies. The request is stamped with that topic and
    /// its id as the correlation id, then sent straight to its producer. A
    /// received reply is dispatched through [`send`](Self::send) and returned;
    /// messages on the topic that carry no or another correlation id are
    /// discarded. `timeout` defaults to the configured call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidArgument`] for a zero timeout,
    /// [`DispatchError::Configuration`] when the reply subscription, channel
    /// factory, mapper, or external bus is missing, and
    /// [`DispatchError::Timeout`] when no reply arrives in time.
    pub async fn call<R, Reply>(&self, request: R, timeout: Option<Duration>) -> Result<Reply, DispatchError>
    where
        R: CallRequest,
        Reply: Request,
    {
        self.call_with_context(request, &RequestContext::new(), timeout)
            .await
    }

    /// [`call`](Self::call) with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_context<R, Reply>(
        &self,
        mut request: R,
        ctx: &RequestContext,
        timeout: Option<Duration>,
    ) -> Result<Reply, DispatchError>
    where
        R: CallRequest,
        Reply: Request,
    {
        let timeout = timeout.unwrap_or(self.config.default_call_timeout);
        if timeout.is_zero() {
            return Err(DispatchError::InvalidArgument(
                "a call timeout must be greater than zero".to_string(),
            ));
        }
        let factory = self.channel_factory.as_ref().ok_or_else(|| {
            DispatchError::configuration("call needs a channel factory to open reply channels")
        })?;
        let template = self
            .reply_subscriptions
            .iter()
            .find(|s| s.request_type == type_name::<Reply>())
            .ok_or_else(|| {
                DispatchError::configuration(format!(
                    "no reply subscription is registered for {}",
                    type_name::<Reply>()
                ))
            })?;
        let reply_mapper = self.mappers.mapper::<Reply>()?;
        let mediator = self.bus.mediator()?;

        let span = info_span!(
            parent: &ctx.span,
            "call",
            request_type = type_name::<R>(),
            reply_type = type_name::<Reply>(),
            request_id = %request.id(),
        );
        async {
            let call_id = Id::random();
            let subscription = template
                .clone()
                .with_channel_name(format!("{}-{call_id}", template.channel_name))
                .with_routing_key(format!("{}.{call_id}", template.routing_key));
            let channel = factory
                .create_channel(&subscription)
                .map_err(DispatchError::ChannelFailure)?;
            channel.purge().await.map_err(DispatchError::ChannelFailure)?;

            let correlation_id = request.id().clone();
            request.set_reply_address(ReplyAddress::new(
                subscription.routing_key.clone(),
                correlation_id.clone(),
            ));
            let mut message = mediator.create_message(&request)?;
            message.header.reply_to = Some(subscription.routing_key.clone());
            message.header.correlation_id = Some(correlation_id.clone());
            mediator.send_now(&message).await?;
            debug!(reply_to = %subscription.routing_key, "awaiting reply");

            let received = await_reply(channel.as_ref(), &correlation_id, timeout).await;
            if let Err(e) = channel.purge().await {
                warn!(reply_to = %subscription.routing_key, error = %e, "could not purge reply topic");
            }
            let received = received?;

            let reply = reply_mapper
                .to_request(&received)
                .map_err(|source| DispatchError::Mapping {
                    message_id: received.id().clone(),
                    source,
                })?;
            let reply_ctx = RequestContext::with_span(tracing::Span::current()).from_message(received);
            self.send_with_context(&reply, &reply_ctx).await?;
            Ok(reply)
        }
        .instrument(span)
        .await
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Schedules `request` to re-enter the processor through `kind` at `when`.
    ///
    /// The fire id is the request id.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] without a scheduler, and the
    /// scheduler's errors for past times and id conflicts.
    pub async fn schedule<R: Request>(
        &self,
        request: &R,
        when: ScheduleTime,
        kind: SchedulerKind,
    ) -> Result<Id, DispatchError> {
        let scheduler = self.scheduler()?;
        let value = serde_json::to_value(request).map_err(|e| DispatchError::Mapping {
            message_id: request.id().clone(),
            source: e.into(),
        })?;
        let fire = ScheduledFire {
            id: request.id().clone(),
            kind,
            request_type: type_name::<R>(),
            job: self.fire_job::<R>(kind, value.clone()),
            request: value,
        };
        scheduler.schedule(fire, when).await
    }

    /// Moves a pending fire. Returns `false` if `id` is not pending.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] without a scheduler and
    /// [`DispatchError::InvalidSchedule`] for a past time.
    pub async fn reschedule(&self, id: &Id, when: ScheduleTime) -> Result<bool, DispatchError> {
        self.scheduler()?.reschedule(id, when).await
    }

    /// Drops a pending fire. Returns `false` if `id` is not pending.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] without a scheduler.
    pub async fn cancel_schedule(&self, id: &Id) -> Result<bool, DispatchError> {
        self.scheduler()?.cancel(id).await
    }

    fn scheduler(&self) -> Result<&Arc<dyn RequestScheduler>, DispatchError> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| DispatchError::configuration("no scheduler is configured"))
    }

    fn fire_job<R: Request>(&self, kind: SchedulerKind, request: serde_json::Value) -> FireJob {
        let processor = self.me.clone();
        Arc::new(move || -> BoxFuture<'static, Result<(), DispatchError>> {
            let processor = processor.clone();
            let request = request.clone();
            Box::pin(async move {
                let processor = processor.upgrade().ok_or_else(|| {
                    DispatchError::configuration("the processor that scheduled this fire is gone")
                })?;
                let request: R = serde_json::from_value(request)
                    .map_err(|e| DispatchError::Handler(e.into()))?;
                match kind {
                    SchedulerKind::Send => processor.send(&request).await,
                    SchedulerKind::Publish => processor.publish(&request).await,
                    SchedulerKind::Post => processor.post(&request).await.map(|_| ()),
                }
            })
        })
    }

    // -----------------------------------------------------------------------
    // Pump entry point
    // -----------------------------------------------------------------------

    /// Decodes `message` as the request type named `request_type` and
    /// dispatches it: commands through send, events and documents through
    /// publish. The message is attached to the context.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Mapping`] when no mapper is registered under
    /// `request_type` or the body does not decode, and otherwise the dispatch
    /// result.
    pub async fn dispatch_message(
        &self,
        request_type: &str,
        message: Message,
        ctx: RequestContext,
    ) -> Result<(), DispatchError> {
        let Some(route) = self.mappers.route(request_type) else {
            return Err(DispatchError::Mapping {
                message_id: message.id().clone(),
                source: anyhow::anyhow!("no message mapper is registered for {request_type}"),
            });
        };
        route(self, message, ctx).await
    }
}
