//! Periodic outbox sweep running on a [`BackgroundWorker`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::error;

use super::mediator::{OutboxProducerMediator, SweepReport};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// On-demand work for the sweeper.
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep now, outside the tick schedule.
    RunNow,
    /// Sweep now and report the result.
    RunAndReport(oneshot::Sender<SweepReport>),
}

/// Sweeps the outbox on every tick.
pub struct OutboxSweeper {
    mediator: Arc<OutboxProducerMediator>,
}

impl OutboxSweeper {
    #[must_use]
    pub fn new(mediator: Arc<OutboxProducerMediator>) -> Self {
        Self { mediator }
    }

    /// Starts sweeping every `sweep_interval` of the mediator's configuration.
    #[must_use]
    pub fn start(mediator: Arc<OutboxProducerMediator>) -> BackgroundWorker<Self> {
        let interval = mediator.config().sweep_interval;
        BackgroundWorker::start(Self::new(mediator), interval)
    }

    async fn sweep(&self) -> SweepReport {
        match self.mediator.sweep().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "outbox sweep failed");
                SweepReport::default()
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for OutboxSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunNow => {
                self.sweep().await;
            }
            SweepTask::RunAndReport(reply) => {
                let _ = reply.send(self.sweep().await);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }
}
