//! Inbox guard: once-only execution per (request id, context key).
//!
//! The pre-check returns an [`InboxCheck`]; only a duplicate under
//! [`OnceOnlyAction::Throw`] becomes an error. The record is written after the
//! rest of the chain succeeds, so a failed attempt can be retried.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ClockSource, Id, Inbox, InboxRecord, Request, RequestContext};

use crate::error::DispatchError;
use crate::pipeline::{Decorator, DecoratorDescriptor, Next, Timing};

pub const NAME: &str = "inbox";

/// What to do when a request has already been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnceOnlyAction {
    /// Abort with [`DispatchError::DuplicateProcessing`].
    #[default]
    Throw,
    /// Log and skip the handler; the dispatch completes successfully.
    Warn,
    /// Run the handler again.
    Continue,
}

/// Outcome of the inbox pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxCheck {
    Allowed,
    Duplicate(OnceOnlyAction),
}

pub struct InboxDecorator {
    inbox: Arc<dyn Inbox>,
    clock: Arc<dyn ClockSource>,
    action: OnceOnlyAction,
    context_key: String,
}

impl InboxDecorator {
    #[must_use]
    pub fn new(
        inbox: Arc<dyn Inbox>,
        clock: Arc<dyn ClockSource>,
        action: OnceOnlyAction,
        context_key: String,
    ) -> Self {
        Self {
            inbox,
            clock,
            action,
            context_key,
        }
    }

    /// Looks the request up. A [`OnceOnlyAction::Continue`] guard never reports
    /// a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Handler`] if the inbox store fails.
    pub async fn check(&self, request_id: &Id) -> Result<InboxCheck, DispatchError> {
        if self.action == OnceOnlyAction::Continue {
            return Ok(InboxCheck::Allowed);
        }
        if self.inbox.exists(request_id, &self.context_key).await? {
            Ok(InboxCheck::Duplicate(self.action))
        } else {
            Ok(InboxCheck::Allowed)
        }
    }
}

#[async_trait]
impl<R: Request> Decorator<R> for InboxDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        let request_id = request.id();
        match self.check(request_id).await? {
            InboxCheck::Duplicate(OnceOnlyAction::Throw) => {
                return Err(DispatchError::DuplicateProcessing {
                    request_id: request_id.clone(),
                    context_key: self.context_key.clone(),
                });
            }
            InboxCheck::Duplicate(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    context_key = %self.context_key,
                    "request already processed, skipping handler"
                );
                return Ok(());
            }
            InboxCheck::Allowed => {}
        }

        next.run(request, ctx).await?;

        let record = InboxRecord {
            request_id: request_id.clone(),
            context_key: self.context_key.clone(),
            request: serde_json::to_value(request).map_err(anyhow::Error::from)?,
            recorded_at: self.clock.now(),
        };
        self.inbox.add(record).await?;
        Ok(())
    }
}

pub fn descriptor<R: Request>(
    step: u32,
    action: OnceOnlyAction,
    context_key: String,
) -> DecoratorDescriptor<R> {
    DecoratorDescriptor::new(step, Timing::Before, NAME, move |services| {
        let inbox = services.inbox.clone().ok_or_else(|| {
            DispatchError::configuration(format!(
                "inbox guard for {context_key} requires an inbox, none was configured"
            ))
        })?;
        Ok(Arc::new(InboxDecorator::new(
            inbox,
            Arc::clone(&services.clock),
            action,
            context_key.clone(),
        )) as Arc<dyn Decorator<R>>)
    })
}
