//! Delivery outcome logic shared by the Reactor and the Proactor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::context::{CHANNEL_NAME, REQUEST_START};
use courier_core::{Channel, ClockSource, Message, MessageKind, RequestContext};
use parking_lot::Mutex;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{debug, error, info, info_span, warn};

use super::control::{PumpControl, PumpState};
use super::middleware::{Delivery, DeliveryService};
use super::subscription::Subscription;
use crate::error::DispatchError;

/// Whether the pump keeps going after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// What one receive produced.
pub(crate) enum Received {
    Message(Message),
    Empty,
    Failed,
}

/// How a delivery was settled with the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Acknowledged,
    Rejected,
    Requeued,
    DeadLettered,
    Stopped,
}

impl Settled {
    fn label(self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Rejected => "rejected",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
            Self::Stopped => "stopped",
        }
    }
}

/// One pump's channel, delivery stack, and bookkeeping.
pub(crate) struct PumpCore {
    subscription: Arc<Subscription>,
    channel: Arc<dyn Channel>,
    service: Mutex<DeliveryService>,
    control: Arc<PumpControl>,
    clock: Arc<dyn ClockSource>,
    unacceptable: AtomicU32,
    performer: usize,
}

impl PumpCore {
    pub(crate) fn new(
        subscription: Arc<Subscription>,
        channel: Arc<dyn Channel>,
        service: DeliveryService,
        control: Arc<PumpControl>,
        clock: Arc<dyn ClockSource>,
        performer: usize,
    ) -> Self {
        Self {
            subscription,
            channel,
            service: Mutex::new(service),
            control,
            clock,
            unacceptable: AtomicU32::new(0),
            performer,
        }
    }

    pub(crate) fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub(crate) fn control(&self) -> &Arc<PumpControl> {
        &self.control
    }

    pub(crate) fn performer(&self) -> usize {
        self.performer
    }

    pub(crate) fn unacceptable_count(&self) -> u32 {
        self.unacceptable.load(Ordering::Relaxed)
    }

    pub(crate) fn unacceptable_limit_reached(&self) -> bool {
        let limit = self.subscription.unacceptable_message_limit;
        limit > 0 && self.unacceptable_count() >= limit
    }

    fn count_unacceptable(&self) {
        self.unacceptable.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the next message, mapping transport errors and empty reads.
    pub(crate) async fn receive(&self) -> Received {
        self.control.set_state(PumpState::Receiving);
        match self.channel.receive(self.subscription.timeout).await {
            Ok(message) if message.is_empty() => Received::Empty,
            Ok(message) => Received::Message(message),
            Err(e) => {
                warn!(channel = %self.subscription.channel_name, error = %e, "receive failed");
                Received::Failed
            }
        }
    }

    /// Takes a message that is already waiting, without blocking.
    pub(crate) async fn receive_ready(&self) -> Option<Message> {
        match self.channel.receive(Duration::ZERO).await {
            Ok(message) if message.is_empty() => None,
            Ok(message) => Some(message),
            Err(e) => {
                warn!(channel = %self.subscription.channel_name, error = %e, "receive failed");
                None
            }
        }
    }

    /// Hands received but unhandled messages back to the channel as they were.
    pub(crate) async fn release(&self, messages: impl IntoIterator<Item = Message>) {
        let channel = self.subscription.channel_name.as_str();
        for message in messages {
            match self.channel.requeue(&message, None).await {
                Ok(true) => debug!(channel, message_id = %message.id(), "released unhandled message"),
                Ok(false) => warn!(channel, message_id = %message.id(), "channel refused released message"),
                Err(e) => error!(channel, message_id = %message.id(), error = %e, "could not release message"),
            }
        }
    }

    /// Dispatches one message and settles it with the channel.
    pub(crate) async fn handle(&self, message: Message) -> Flow {
        let _guard = self.control.in_flight_guard();
        let channel = self.subscription.channel_name.as_str();

        match message.kind() {
            MessageKind::Quit => {
                info!(channel, "quit message received, stopping");
                self.record(Settled::Stopped);
                return Flow::Stop;
            }
            MessageKind::Unacceptable => {
                warn!(channel, message_id = %message.id(), "unacceptable message, acknowledging");
                self.count_unacceptable();
                self.acknowledge(&message).await;
                return Flow::Continue;
            }
            MessageKind::None => return Flow::Continue,
            MessageKind::Command | MessageKind::Event | MessageKind::Document => {}
        }

        self.control.set_state(PumpState::Dispatching);
        let Some(request_type) = self.subscription.request_type_for(&message) else {
            warn!(channel, message_id = %message.id(), "no request type matches message, rejecting");
            self.count_unacceptable();
            self.reject(&message).await;
            return Flow::Continue;
        };

        let ctx = RequestContext::with_span(info_span!(
            "pump",
            channel,
            performer = self.performer,
        ));
        ctx.insert(CHANNEL_NAME, channel);
        ctx.insert(REQUEST_START, self.clock.now());

        let result = self
            .deliver(Delivery {
                request_type,
                message: message.clone(),
                ctx,
            })
            .await;

        self.control.set_state(PumpState::Acking);
        match result {
            Ok(()) => {
                self.acknowledge(&message).await;
                Flow::Continue
            }
            Err(DispatchError::DuplicateProcessing { .. }) => {
                debug!(channel, message_id = %message.id(), "already processed, acknowledging");
                self.acknowledge(&message).await;
                Flow::Continue
            }
            Err(e) if e.is_configuration() => {
                error!(channel, message_id = %message.id(), error = %e, "configuration error, rejecting and stopping");
                self.reject(&message).await;
                Flow::Stop
            }
            Err(e @ DispatchError::Mapping { .. }) => {
                warn!(channel, message_id = %message.id(), error = %e, "message could not be mapped, rejecting");
                self.count_unacceptable();
                self.reject(&message).await;
                Flow::Continue
            }
            Err(e) if e.is_transient() => {
                self.requeue_or_dead_letter(message, &e).await;
                Flow::Continue
            }
            Err(e) => {
                error!(channel, message_id = %message.id(), error = %e, "dispatch failed, acknowledging");
                self.acknowledge(&message).await;
                Flow::Continue
            }
        }
    }

    async fn deliver(&self, delivery: Delivery) -> Result<(), DispatchError> {
        let service = self.service.lock().clone();
        service.oneshot(delivery).await
    }

    async fn requeue_or_dead_letter(&self, mut message: Message, cause: &DispatchError) {
        let channel = self.subscription.channel_name.as_str();
        message.increment_handled_count();

        if let Some(max) = self.subscription.max_attempts() {
            if message.handled_count_reached(max) {
                warn!(
                    channel,
                    message_id = %message.id(),
                    handled_count = message.header.handled_count,
                    max_attempts = max,
                    error = %cause,
                    "delivery attempts exhausted, rejecting"
                );
                if self.settle(self.channel.reject(&message).await, &message) {
                    self.record(Settled::DeadLettered);
                }
                return;
            }
        }

        let delay = cause
            .requeue_delay()
            .unwrap_or(self.subscription.requeue_delay);
        debug!(
            channel,
            message_id = %message.id(),
            handled_count = message.header.handled_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %cause,
            "requeueing"
        );
        match self
            .channel
            .requeue(&message, (!delay.is_zero()).then_some(delay))
            .await
        {
            Ok(true) => self.record(Settled::Requeued),
            Ok(false) => {
                warn!(channel, message_id = %message.id(), "channel refused requeue, rejecting");
                self.reject(&message).await;
            }
            Err(e) => {
                error!(channel, message_id = %message.id(), error = %e, "requeue failed");
            }
        }
    }

    async fn acknowledge(&self, message: &Message) {
        if self.settle(self.channel.acknowledge(message).await, message) {
            self.record(Settled::Acknowledged);
        }
    }

    async fn reject(&self, message: &Message) {
        if self.settle(self.channel.reject(message).await, message) {
            self.record(Settled::Rejected);
        }
    }

    fn settle(&self, result: anyhow::Result<()>, message: &Message) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(
                    channel = %self.subscription.channel_name,
                    message_id = %message.id(),
                    error = %e,
                    "could not settle message with the channel"
                );
                false
            }
        }
    }

    fn record(&self, settled: Settled) {
        metrics::counter!(
            "courier_pump_messages_total",
            "channel" => self.subscription.channel_name.clone(),
            "outcome" => settled.label()
        )
        .increment(1);
    }
}

/// Resolves once a stop has been requested.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|requested| *requested).await;
}

/// Sleeps for `delay` unless a stop arrives first.
pub(crate) async fn idle(stop: &mut watch::Receiver<bool>, delay: Duration) {
    tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = stopped(stop) => {}
    }
}
