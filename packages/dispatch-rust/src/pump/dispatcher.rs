//! Owns the pumps for a set of subscriptions and starts and stops them by name.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{ClockSource, SystemClock};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::control::{PumpControl, PumpState};
use super::middleware::build_delivery_service;
use super::outcome::PumpCore;
use super::proactor::Proactor;
use super::reactor::Reactor;
use super::subscription::{ChannelFactory, MessagePumpType, Subscription};
use super::PumpHandle;
use crate::error::DispatchError;
use crate::processor::CommandProcessor;

/// Permits shared by all Proactor deliveries of one dispatcher.
pub const DEFAULT_PROACTOR_LIMIT: usize = 32;

/// Assembles a [`Dispatcher`].
pub struct DispatcherBuilder {
    processor: Arc<CommandProcessor>,
    channel_factory: Arc<dyn ChannelFactory>,
    subscriptions: Vec<Subscription>,
    proactor_limit: usize,
    clock: Option<Arc<dyn ClockSource>>,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn new(processor: Arc<CommandProcessor>, channel_factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            processor,
            channel_factory,
            subscriptions: Vec::new(),
            proactor_limit: DEFAULT_PROACTOR_LIMIT,
            clock: None,
        }
    }

    #[must_use]
    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Concurrent Proactor deliveries across every subscription.
    #[must_use]
    pub fn with_proactor_limit(mut self, limit: usize) -> Self {
        self.proactor_limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when two subscriptions share a name.
    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        let mut subscriptions: Vec<Arc<Subscription>> = Vec::with_capacity(self.subscriptions.len());
        for subscription in self.subscriptions {
            if subscriptions.iter().any(|s| s.name == subscription.name) {
                return Err(DispatchError::configuration(format!(
                    "subscription `{}` is registered twice",
                    subscription.name
                )));
            }
            subscriptions.push(Arc::new(subscription));
        }
        Ok(Dispatcher {
            processor: self.processor,
            channel_factory: self.channel_factory,
            subscriptions,
            limit: Arc::new(Semaphore::new(self.proactor_limit)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            pumps: Mutex::new(HashMap::new()),
        })
    }
}

/// Runs `number_of_performers` pumps per subscription.
///
/// Pumps are started with [`receive`](Self::receive) or [`open`](Self::open)
/// and stopped with [`shut`](Self::shut) or [`end`](Self::end). A stopped
/// subscription can be opened again; it gets fresh channels.
pub struct Dispatcher {
    processor: Arc<CommandProcessor>,
    channel_factory: Arc<dyn ChannelFactory>,
    subscriptions: Vec<Arc<Subscription>>,
    limit: Arc<Semaphore>,
    clock: Arc<dyn ClockSource>,
    pumps: Mutex<HashMap<String, Vec<PumpHandle>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn builder(
        processor: Arc<CommandProcessor>,
        channel_factory: Arc<dyn ChannelFactory>,
    ) -> DispatcherBuilder {
        DispatcherBuilder::new(processor, channel_factory)
    }

    #[must_use]
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter().map(Arc::as_ref)
    }

    /// Opens every subscription.
    ///
    /// # Errors
    ///
    /// Fails on the first subscription that cannot be opened; the ones opened
    /// before it keep running.
    pub fn receive(&self) -> Result<(), DispatchError> {
        for subscription in &self.subscriptions {
            self.open(&subscription.name)?;
        }
        Ok(())
    }

    /// Starts the pumps of the subscription called `name`. Opening a
    /// subscription whose pumps are running does nothing.
    ///
    /// Proactor pumps are spawned on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for an unknown name and
    /// [`DispatchError::ChannelFailure`] when a channel cannot be created.
    pub fn open(&self, name: &str) -> Result<(), DispatchError> {
        let subscription = self.find(name)?;
        let mut pumps = self.pumps.lock();
        if pumps
            .get(name)
            .is_some_and(|handles| handles.iter().any(|h| !h.is_finished()))
        {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(subscription.number_of_performers);
        for performer in 0..subscription.number_of_performers {
            match self.start_pump(subscription, performer) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        handle.control().request_stop();
                    }
                    pumps.insert(name.to_string(), handles);
                    return Err(e);
                }
            }
        }
        info!(
            subscription = name,
            performers = handles.len(),
            pump_type = ?subscription.pump_type,
            "subscription opened"
        );
        pumps.insert(name.to_string(), handles);
        Ok(())
    }

    fn start_pump(
        &self,
        subscription: &Arc<Subscription>,
        performer: usize,
    ) -> Result<PumpHandle, DispatchError> {
        let channel = self
            .channel_factory
            .create_channel(subscription)
            .map_err(DispatchError::ChannelFailure)?;
        let limit = match subscription.pump_type {
            MessagePumpType::Proactor => Some(Arc::clone(&self.limit)),
            MessagePumpType::Reactor => None,
        };
        let service = build_delivery_service(Arc::clone(&self.processor), subscription, limit);
        let core = Arc::new(PumpCore::new(
            Arc::clone(subscription),
            channel,
            service,
            Arc::new(PumpControl::new()),
            Arc::clone(&self.clock),
            performer,
        ));
        match subscription.pump_type {
            MessagePumpType::Reactor => Reactor::new(core)
                .start()
                .map_err(|e| DispatchError::Handler(e.into())),
            MessagePumpType::Proactor => Ok(Proactor::new(core).start()),
        }
    }

    /// Stops the pumps of the subscription called `name` and waits for their
    /// in-flight deliveries to settle.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for an unknown name.
    pub async fn shut(&self, name: &str) -> Result<(), DispatchError> {
        self.find(name)?;
        let handles = self.pumps.lock().remove(name).unwrap_or_default();
        if handles.is_empty() {
            return Ok(());
        }
        for handle in &handles {
            handle.control().request_stop();
        }
        for handle in handles {
            handle.join().await;
        }
        info!(subscription = name, "subscription shut");
        Ok(())
    }

    /// Shuts every subscription, last opened first.
    pub async fn end(&self) {
        for subscription in self.subscriptions.iter().rev() {
            if let Err(e) = self.shut(&subscription.name).await {
                warn!(subscription = %subscription.name, error = %e, "could not shut subscription");
            }
        }
    }

    /// Pumps currently held for `name`, running or stopped.
    #[must_use]
    pub fn pump_count(&self, name: &str) -> usize {
        self.pumps.lock().get(name).map_or(0, Vec::len)
    }

    /// State of each pump of `name`, in performer order.
    #[must_use]
    pub fn pump_states(&self, name: &str) -> Vec<PumpState> {
        self.pumps
            .lock()
            .get(name)
            .map(|handles| handles.iter().map(PumpHandle::state).collect())
            .unwrap_or_default()
    }

    /// Deliveries of `name` being handled right now, across its pumps.
    #[must_use]
    pub fn in_flight(&self, name: &str) -> u64 {
        self.pumps.lock().get(name).map_or(0, |handles| {
            handles.iter().map(|h| h.control().in_flight_count()).sum()
        })
    }

    /// Whether any pump of `name` is still running.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.pump_states(name)
            .iter()
            .any(|state| *state != PumpState::Stopped)
    }

    fn find(&self, name: &str) -> Result<&Arc<Subscription>, DispatchError> {
        self.subscriptions
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| DispatchError::configuration(format!("no subscription is named `{name}`")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
