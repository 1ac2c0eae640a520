//! Blocking pump: one loop per channel on a dedicated OS thread.

use std::sync::Arc;
use std::thread;

use tracing::{info, warn, Instrument};

use super::outcome::{idle, stopped, Flow, PumpCore, Received};
use super::PumpHandle;

/// Pumps one channel on its own thread, one message at a time.
pub struct Reactor {
    core: Arc<PumpCore>,
}

impl Reactor {
    pub(crate) fn new(core: Arc<PumpCore>) -> Self {
        Self { core }
    }

    /// Spawns the pump thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn start(self) -> std::io::Result<PumpHandle> {
        let control = Arc::clone(self.core.control());
        let name = format!(
            "courier-reactor-{}-{}",
            self.core.subscription().channel_name,
            self.core.performer()
        );
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let core = self.core;
        let thread = thread::Builder::new().name(name).spawn(move || {
            runtime.block_on(run(core));
        })?;
        Ok(PumpHandle::thread(control, thread))
    }
}

/// Receives and handles messages until stopped.
pub(crate) async fn run(core: Arc<PumpCore>) {
    let subscription = core.subscription();
    let span = tracing::info_span!(
        "reactor",
        channel = %subscription.channel_name,
        performer = core.performer(),
    );
    async {
        let mut stop = core.control().stop_receiver();
        info!("pump started");
        loop {
            if core.control().is_stopping() {
                break;
            }
            if core.unacceptable_limit_reached() {
                warn!(
                    unacceptable = core.unacceptable_count(),
                    "unacceptable message limit reached, stopping"
                );
                break;
            }

            let received = tokio::select! {
                received = core.receive() => received,
                () = stopped(&mut stop) => break,
            };
            match received {
                Received::Failed => idle(&mut stop, subscription.channel_failure_delay).await,
                Received::Empty => idle(&mut stop, subscription.empty_channel_delay).await,
                Received::Message(message) => {
                    if core.handle(message).await == Flow::Stop {
                        break;
                    }
                }
            }
        }
        core.control().mark_stopped();
        info!("pump stopped");
    }
    .instrument(span)
    .await;
}
