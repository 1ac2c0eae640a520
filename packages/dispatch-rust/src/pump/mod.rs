//! Message pumps: turn channel traffic into processor dispatches and settle
//! each message with the channel.
//!
//! The [`Reactor`] and the [`Proactor`] share the delivery stack and the
//! outcome rules; they differ only in how they are scheduled.

mod outcome;

pub mod control;
pub mod dispatcher;
pub mod middleware;
pub mod proactor;
pub mod reactor;
pub mod subscription;

use std::sync::Arc;

use tracing::error;

pub use control::{InFlightGuard, PumpControl, PumpState};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use middleware::{build_delivery_service, Delivery, DeliveryService};
pub use proactor::Proactor;
pub use reactor::Reactor;
pub use subscription::{ChannelFactory, DeadLetterPolicy, MessagePumpType, RequestTypeMap, Subscription};

enum Runner {
    Thread(std::thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

/// A running pump.
pub struct PumpHandle {
    control: Arc<PumpControl>,
    runner: Runner,
}

impl PumpHandle {
    pub(crate) fn thread(control: Arc<PumpControl>, handle: std::thread::JoinHandle<()>) -> Self {
        Self {
            control,
            runner: Runner::Thread(handle),
        }
    }

    pub(crate) fn task(control: Arc<PumpControl>, handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            control,
            runner: Runner::Task(handle),
        }
    }

    #[must_use]
    pub fn control(&self) -> &Arc<PumpControl> {
        &self.control
    }

    #[must_use]
    pub fn state(&self) -> PumpState {
        self.control.state()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        match &self.runner {
            Runner::Thread(handle) => handle.is_finished(),
            Runner::Task(handle) => handle.is_finished(),
        }
    }

    /// Asks the pump to stop and waits until it has.
    pub async fn stop(self) {
        self.control.request_stop();
        self.join().await;
    }

    /// Waits for the pump to stop on its own.
    pub async fn join(self) {
        match self.runner {
            Runner::Thread(handle) => {
                match tokio::task::spawn_blocking(move || handle.join()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => error!("reactor thread panicked"),
                    Err(e) => error!(error = %e, "could not join reactor thread"),
                }
            }
            Runner::Task(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "proactor task failed");
                }
            }
        }
    }
}
