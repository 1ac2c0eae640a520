//! The processor's handle on the outbox and the producers behind it.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::error::DispatchError;
use crate::outbox::{OutboxProducerMediator, OutboxSweeper};
use crate::worker::BackgroundWorker;

/// Context object naming the outbox mediator the processor posts through.
///
/// Constructed explicitly and passed to
/// [`CommandProcessorBuilder`](super::CommandProcessorBuilder). Processors that
/// share a bus share its outbox bookkeeping.
#[derive(Default)]
pub struct ExternalBus {
    mediator: ArcSwapOption<OutboxProducerMediator>,
}

impl ExternalBus {
    #[must_use]
    pub fn new(mediator: Arc<OutboxProducerMediator>) -> Self {
        Self {
            mediator: ArcSwapOption::from(Some(mediator)),
        }
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when no mediator is set.
    pub fn mediator(&self) -> Result<Arc<OutboxProducerMediator>, DispatchError> {
        self.mediator.load_full().ok_or_else(|| {
            DispatchError::configuration(
                "no external bus is configured; posting needs an outbox and producers",
            )
        })
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.mediator.load().is_some()
    }

    /// Starts the background sweeper for the current mediator.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when no mediator is set.
    pub fn start_sweeper(&self) -> Result<BackgroundWorker<OutboxSweeper>, DispatchError> {
        Ok(OutboxSweeper::start(self.mediator()?))
    }

    /// Drops the mediator. Meant for test harnesses that reuse one bus
    /// across cases.
    pub fn reset(&self) {
        self.mediator.store(None);
    }
}
