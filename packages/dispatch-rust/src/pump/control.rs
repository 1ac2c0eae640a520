//! Pump lifecycle: state, stop signal, and in-flight delivery tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for in-flight deliveries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Where a pump is in its cycle.
///
/// `Idle -> Receiving -> Dispatching -> Acking -> Receiving`, with `Stopping`
/// reachable from any state and `Stopped` once in-flight work has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Receiving,
    Dispatching,
    Acking,
    Stopping,
    Stopped,
}

impl PumpState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

/// Shared between a pump and whoever owns it.
///
/// `request_stop` is cooperative: the pump finishes the delivery in hand,
/// including its acknowledge or reject, before it leaves the loop.
#[derive(Debug)]
pub struct PumpControl {
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<PumpState>>,
}

impl PumpControl {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stop_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(PumpState::Idle)),
        }
    }

    #[must_use]
    pub fn state(&self) -> PumpState {
        **self.state.load()
    }

    /// Moves to `next` unless a stop is already under way.
    pub fn set_state(&self, next: PumpState) {
        self.state.rcu(|current| {
            if current.is_terminal() {
                Arc::clone(current)
            } else {
                Arc::new(next)
            }
        });
    }

    /// Receiver that flips to `true` when a stop is requested.
    #[must_use]
    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    pub fn request_stop(&self) {
        self.state.rcu(|current| {
            if **current == PumpState::Stopped {
                Arc::clone(current)
            } else {
                Arc::new(PumpState::Stopping)
            }
        });
        self.stop_signal.send_replace(true);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stop_signal.borrow() || self.state().is_terminal()
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.store(Arc::new(PumpState::Stopped));
        self.stop_signal.send_replace(true);
    }

    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for PumpControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped, even if the handler panics.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
