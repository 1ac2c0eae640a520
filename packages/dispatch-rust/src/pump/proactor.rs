//! Non-blocking pump: channels pumped as tasks on the shared runtime.

use std::sync::Arc;

use courier_core::Message;
use tracing::{error, info, warn, Instrument};

use super::outcome::{idle, stopped, Flow, PumpCore, Received};
use super::PumpHandle;

/// Pumps one channel as a task on the shared runtime.
///
/// Each receive takes up to `buffer_size` waiting messages, which are then
/// handled one after another in receive order. Deliveries of different
/// channels and performers run concurrently, bounded by the dispatcher's
/// Proactor limit.
pub struct Proactor {
    core: Arc<PumpCore>,
}

impl Proactor {
    pub(crate) fn new(core: Arc<PumpCore>) -> Self {
        Self { core }
    }

    /// Spawns the pump on the current runtime.
    #[must_use]
    pub fn start(self) -> PumpHandle {
        let control = Arc::clone(self.core.control());
        PumpHandle::task(control, tokio::spawn(run(self.core)))
    }
}

/// Handles `message` on its own task so a panicking handler cannot take the
/// pump down with it.
async fn deliver(core: &Arc<PumpCore>, message: Message) -> Flow {
    let task_core = Arc::clone(core);
    let delivery = tokio::spawn(
        async move { task_core.handle(message).await }.instrument(tracing::Span::current()),
    );
    match delivery.await {
        Ok(flow) => flow,
        Err(e) => {
            error!(error = %e, "delivery task failed");
            Flow::Continue
        }
    }
}

/// Receives and handles messages until stopped. A stop lets the current
/// delivery finish and hands the rest of its batch back to the channel.
pub(crate) async fn run(core: Arc<PumpCore>) {
    let span = tracing::info_span!(
        "proactor",
        channel = %core.subscription().channel_name,
        performer = core.performer(),
    );
    async {
        let subscription = core.subscription();
        let buffer = subscription.buffer_size.max(1);
        let mut stop = core.control().stop_receiver();
        info!(buffer, "pump started");

        'pump: loop {
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
            let first = match received {
                Received::Failed => {
                    idle(&mut stop, subscription.channel_failure_delay).await;
                    continue;
                }
                Received::Empty => {
                    idle(&mut stop, subscription.empty_channel_delay).await;
                    continue;
                }
                Received::Message(message) => message,
            };

            let mut batch = vec![first];
            while batch.len() < buffer {
                match core.receive_ready().await {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }

            let mut pending = batch.into_iter();
            while let Some(message) = pending.next() {
                if deliver(&core, message).await == Flow::Stop {
                    core.release(pending).await;
                    break 'pump;
                }
                if core.control().is_stopping() || core.unacceptable_limit_reached() {
                    core.release(pending).await;
                    continue 'pump;
                }
            }
        }

        core.control().request_stop();
        core.control().mark_stopped();
        info!("pump stopped");
    }
    .instrument(span)
    .await;
}
