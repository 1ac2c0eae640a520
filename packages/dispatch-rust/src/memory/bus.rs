//! Process-local broker: topic queues with delayed visibility, plus the
//! producer, channel and channel factory that sit on top of them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::message::{ORIGINAL_MESSAGE_ID, RECEIVED_ON_CHANNEL, REJECTION_REASON};
use courier_core::{Channel, Id, Message, Producer, Publication};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::pump::{ChannelFactory, Subscription};

struct Queued {
    message: Message,
    visible_at: Instant,
}

#[derive(Default)]
struct TopicQueue {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
}

/// Topic-keyed message queues shared by producers and channels.
#[derive(Default)]
pub struct InternalBus {
    topics: DashMap<String, Arc<TopicQueue>>,
}

impl InternalBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn topic(&self, topic: &str) -> Arc<TopicQueue> {
        Arc::clone(self.topics.entry(topic.to_string()).or_default().value())
    }

    /// Appends `message` to `topic`, visible once `delay` has elapsed.
    pub fn enqueue(&self, topic: &str, message: Message, delay: Duration) {
        let queue = self.topic(topic);
        queue.queue.lock().push_back(Queued {
            message,
            visible_at: Instant::now() + delay,
        });
        queue.notify.notify_one();
    }

    /// Takes the oldest visible message from `topic`, waiting up to `timeout`.
    pub async fn dequeue(&self, topic: &str, timeout: Duration) -> Option<Message> {
        let queue = self.topic(topic);
        let deadline = Instant::now() + timeout;
        loop {
            let notified = queue.notify.notified();
            let next_visible = {
                let mut pending = queue.queue.lock();
                let now = Instant::now();
                if let Some(pos) = pending.iter().position(|q| q.visible_at <= now) {
                    return pending.remove(pos).map(|q| q.message);
                }
                pending.iter().map(|q| q.visible_at).min()
            };
            if Instant::now() >= deadline {
                return None;
            }
            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Number of queued messages on `topic`, visible or not.
    #[must_use]
    pub fn len(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |q| q.queue.lock().len())
    }

    pub fn purge(&self, topic: &str) {
        if let Some(queue) = self.topics.get(topic) {
            queue.queue.lock().clear();
        }
    }

    /// Snapshot of the messages queued on `topic`.
    #[must_use]
    pub fn peek_all(&self, topic: &str) -> Vec<Message> {
        self.topics.get(topic).map_or_else(Vec::new, |q| {
            q.queue.lock().iter().map(|q| q.message.clone()).collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Sends to the bus topic named by the message header.
pub struct InMemoryProducer {
    bus: Arc<InternalBus>,
    publication: Publication,
}

impl InMemoryProducer {
    #[must_use]
    pub fn new(bus: Arc<InternalBus>, publication: Publication) -> Self {
        Self { bus, publication }
    }
}

#[async_trait]
impl Producer for InMemoryProducer {
    fn publication(&self) -> &Publication {
        &self.publication
    }

    async fn send(&self, message: &Message) -> anyhow::Result<()> {
        self.send_with_delay(message, Duration::ZERO).await
    }

    async fn send_with_delay(&self, message: &Message, delay: Duration) -> anyhow::Result<()> {
        debug!(message_id = %message.id(), topic = %message.header.topic, "bus send");
        self.bus
            .enqueue(&message.header.topic, message.clone(), delay);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Consumer of one bus topic.
///
/// Rejected messages go to the dead-letter topic when one is configured and are
/// dropped otherwise.
pub struct InMemoryChannel {
    name: String,
    routing_key: String,
    dead_letter_topic: Option<String>,
    bus: Arc<InternalBus>,
    in_flight: DashSet<Id>,
    acknowledged: AtomicUsize,
    rejected: AtomicUsize,
}

impl InMemoryChannel {
    #[must_use]
    pub fn new(
        bus: Arc<InternalBus>,
        name: impl Into<String>,
        routing_key: impl Into<String>,
        dead_letter_topic: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            routing_key: routing_key.into(),
            dead_letter_topic,
            bus,
            in_flight: DashSet::new(),
            acknowledged: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Messages received and not yet acknowledged, rejected or requeued.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn receive(&self, timeout: Duration) -> anyhow::Result<Message> {
        match self.bus.dequeue(&self.routing_key, timeout).await {
            Some(mut message) => {
                message
                    .header
                    .bag
                    .insert(RECEIVED_ON_CHANNEL.to_string(), self.name.clone().into());
                self.in_flight.insert(message.id().clone());
                Ok(message)
            }
            None => Ok(Message::empty()),
        }
    }

    async fn acknowledge(&self, message: &Message) -> anyhow::Result<()> {
        self.in_flight.remove(message.id());
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(&self, message: &Message) -> anyhow::Result<()> {
        self.in_flight.remove(message.id());
        self.rejected.fetch_add(1, Ordering::Relaxed);
        if let Some(topic) = &self.dead_letter_topic {
            let mut dead = message.clone();
            dead.header.bag.insert(
                ORIGINAL_MESSAGE_ID.to_string(),
                message.id().to_string().into(),
            );
            dead.header.bag.insert(
                REJECTION_REASON.to_string(),
                format!("rejected by channel {}", self.name).into(),
            );
            debug!(message_id = %message.id(), dead_letter = %topic, "dead lettering");
            self.bus.enqueue(topic, dead, Duration::ZERO);
        }
        Ok(())
    }

    async fn requeue(&self, message: &Message, delay: Option<Duration>) -> anyhow::Result<bool> {
        self.in_flight.remove(message.id());
        self.bus.enqueue(
            &self.routing_key,
            message.clone(),
            delay.unwrap_or(Duration::ZERO),
        );
        Ok(true)
    }

    async fn purge(&self) -> anyhow::Result<()> {
        self.bus.purge(&self.routing_key);
        Ok(())
    }
}

/// Creates [`InMemoryChannel`]s on a shared bus and keeps the last channel made
/// for each subscription so tests can inspect it.
pub struct InMemoryChannelFactory {
    bus: Arc<InternalBus>,
    channels: DashMap<String, Arc<InMemoryChannel>>,
}

impl InMemoryChannelFactory {
    #[must_use]
    pub fn new(bus: Arc<InternalBus>) -> Self {
        Self {
            bus,
            channels: DashMap::new(),
        }
    }

    #[must_use]
    pub fn channel(&self, channel_name: &str) -> Option<Arc<InMemoryChannel>> {
        self.channels.get(channel_name).map(|c| Arc::clone(c.value()))
    }
}

impl ChannelFactory for InMemoryChannelFactory {
    fn create_channel(&self, subscription: &Subscription) -> anyhow::Result<Arc<dyn Channel>> {
        let channel = Arc::new(InMemoryChannel::new(
            Arc::clone(&self.bus),
            subscription.channel_name.clone(),
            subscription.routing_key.clone(),
            subscription
                .dead_letter
                .as_ref()
                .map(|policy| policy.routing_key.clone()),
        ));
        self.channels
            .insert(subscription.channel_name.clone(), Arc::clone(&channel));
        Ok(channel)
    }
}
