//! Deferred dispatch: requests fired back into the processor at a later time.

pub mod timer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::Id;

use crate::error::DispatchError;
use crate::pipeline::BoxFuture;

pub use timer::InMemoryScheduler;

/// Which processor operation a fire re-enters through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    Send,
    Post,
    Publish,
}

/// When a fire is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTime {
    /// After this long from now.
    Delay(Duration),
    /// At this millis-since-epoch reading of the scheduler's clock.
    At(u64),
}

/// What to do when scheduling an id that is already scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    #[default]
    Throw,
    Overwrite,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub on_conflict: OnConflict,
}

/// Future run when a fire is due.
pub type FireJob = Arc<dyn Fn() -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// A request waiting to be re-injected.
#[derive(Clone)]
pub struct ScheduledFire {
    pub id: Id,
    pub kind: SchedulerKind,
    pub request_type: &'static str,
    /// The request, serialized, for schedulers that persist fires.
    pub request: serde_json::Value,
    pub job: FireJob,
}

impl fmt::Debug for ScheduledFire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledFire")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("request_type", &self.request_type)
            .finish_non_exhaustive()
    }
}

/// Holds fires until they are due, then runs their job at least once.
#[async_trait]
pub trait RequestScheduler: Send + Sync {
    /// Schedules `fire` for `when` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidSchedule`] for a time in the past and
    /// [`DispatchError::SchedulerConflict`] when the id is taken and the
    /// conflict policy is [`OnConflict::Throw`].
    async fn schedule(&self, fire: ScheduledFire, when: ScheduleTime) -> Result<Id, DispatchError>;

    /// Moves a pending fire. Returns `false` if `id` is not pending.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidSchedule`] for a time in the past.
    async fn reschedule(&self, id: &Id, when: ScheduleTime) -> Result<bool, DispatchError>;

    /// Drops a pending fire. Returns `false` if `id` is not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    async fn cancel(&self, id: &Id) -> Result<bool, DispatchError>;
}
