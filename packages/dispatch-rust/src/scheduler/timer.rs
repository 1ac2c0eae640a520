//! Scheduler backed by tokio timers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ClockSource, Id, SystemClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use super::{OnConflict, RequestScheduler, ScheduleTime, ScheduledFire, SchedulerConfig};
use crate::error::DispatchError;

struct Pending {
    fire: ScheduledFire,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Keeps fires in memory, one sleeping tokio task each.
///
/// Pending fires are lost when the process stops.
pub struct InMemoryScheduler {
    pending: Arc<DashMap<Id, Pending>>,
    clock: Arc<dyn ClockSource>,
    config: SchedulerConfig,
    generations: AtomicU64,
}

impl InMemoryScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Uses `clock` to resolve [`ScheduleTime::At`].
    #[must_use]
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            clock,
            config,
            generations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: &Id) -> bool {
        self.pending.contains_key(id)
    }

    fn delay_until(&self, when: ScheduleTime) -> Result<Duration, DispatchError> {
        match when {
            ScheduleTime::Delay(delay) => Ok(delay),
            ScheduleTime::At(at) => {
                let now = self.clock.now();
                if at < now {
                    return Err(DispatchError::InvalidSchedule(format!(
                        "fire time {at} is {} ms in the past",
                        now - at
                    )));
                }
                Ok(Duration::from_millis(at - now))
            }
        }
    }

    fn arm(&self, fire: ScheduledFire, delay: Duration) -> Pending {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let id = fire.id.clone();
        let job = Arc::clone(&fire.job);
        let span = tracing::info_span!("scheduled_fire", fire_id = %id, kind = ?fire.kind);
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                pending.remove_if(&id, |_, p| p.generation == generation);
                debug!("firing");
                if let Err(e) = job().await {
                    error!(error = %e, "scheduled fire failed");
                }
            }
            .instrument(span),
        );
        Pending {
            fire,
            generation,
            timer,
        }
    }
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for InMemoryScheduler {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.timer.abort();
        }
    }
}

#[async_trait]
impl RequestScheduler for InMemoryScheduler {
    async fn schedule(&self, fire: ScheduledFire, when: ScheduleTime) -> Result<Id, DispatchError> {
        let delay = self.delay_until(when)?;
        let id = fire.id.clone();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.config.on_conflict == OnConflict::Throw {
                    return Err(DispatchError::SchedulerConflict(id.to_string()));
                }
                let replaced = std::mem::replace(occupied.get_mut(), self.arm(fire, delay));
                replaced.timer.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.arm(fire, delay));
            }
        }
        debug!(fire_id = %id, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "scheduled");
        Ok(id)
    }

    async fn reschedule(&self, id: &Id, when: ScheduleTime) -> Result<bool, DispatchError> {
        let delay = self.delay_until(when)?;
        let Some(mut pending) = self.pending.get_mut(id) else {
            return Ok(false);
        };
        let fire = pending.fire.clone();
        let replaced = std::mem::replace(&mut *pending, self.arm(fire, delay));
        replaced.timer.abort();
        Ok(true)
    }

    async fn cancel(&self, id: &Id) -> Result<bool, DispatchError> {
        Ok(match self.pending.remove(id) {
            Some((_, pending)) => {
                pending.timer.abort();
                true
            }
            None => false,
        })
    }
}
