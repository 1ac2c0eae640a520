//! Decorated handler chains.
//!
//! A [`Pipeline`] is a flat list of links: the Before decorators in step order,
//! the handler, then the After decorators in descending step order. Each link receives a
//! [`Next`] continuation for the links after it. A Before decorator that wants
//! to act after the handler (monitoring, inbox recording) awaits `next` and
//! inspects the result; one that wants to skip the handler (an inbox hit in
//! Warn mode) returns without calling it.

pub mod builder;
pub mod decorators;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ClockSource, Inbox, Request, RequestContext};

use crate::error::DispatchError;
use crate::handler::{Handler, HandlerType};
use crate::policy::PolicyRegistry;

pub use builder::{DispatchMode, PipelineBuilder};

/// Boxed future returned by chain continuations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether a decorator runs before or after the handler it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timing {
    Before,
    After,
}

/// Cross-cutting behavior wrapped around a handler.
#[async_trait]
pub trait Decorator<R: Request>: Send + Sync {
    /// Runs this link. Call `next.run(..)` to continue the chain.
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError>;
}

/// Collaborators decorators may need when they are instantiated.
#[derive(Clone)]
pub struct PipelineServices {
    pub inbox: Option<Arc<dyn Inbox>>,
    pub policies: Arc<PolicyRegistry>,
    pub clock: Arc<dyn ClockSource>,
}

type DecoratorFactory<R> =
    Arc<dyn Fn(&PipelineServices) -> Result<Arc<dyn Decorator<R>>, DispatchError> + Send + Sync>;

/// Declares a decorator: where it sits in the chain and how to build it.
pub struct DecoratorDescriptor<R: Request> {
    step: u32,
    timing: Timing,
    name: &'static str,
    factory: DecoratorFactory<R>,
}

impl<R: Request> Clone for DecoratorDescriptor<R> {
    fn clone(&self) -> Self {
        Self {
            step: self.step,
            timing: self.timing,
            name: self.name,
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<R: Request> DecoratorDescriptor<R> {
    /// Describes a decorator built by `factory`. `name` identifies it in
    /// chain descriptions and logs.
    pub fn new<F>(step: u32, timing: Timing, name: &'static str, factory: F) -> Self
    where
        F: Fn(&PipelineServices) -> Result<Arc<dyn Decorator<R>>, DispatchError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            step,
            timing,
            name,
            factory: Arc::new(factory),
        }
    }

    /// Describes a decorator that needs no collaborators.
    pub fn from_fn<F, D>(step: u32, timing: Timing, name: &'static str, make: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: Decorator<R> + 'static,
    {
        Self::new(step, timing, name, move |_| {
            Ok(Arc::new(make()) as Arc<dyn Decorator<R>>)
        })
    }

    #[must_use]
    pub fn step(&self) -> u32 {
        self.step
    }

    #[must_use]
    pub fn timing(&self) -> Timing {
        self.timing
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn build(
        &self,
        services: &PipelineServices,
    ) -> Result<Arc<dyn Decorator<R>>, DispatchError> {
        (self.factory)(services)
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

pub(crate) enum Link<R: Request> {
    Decorator {
        name: &'static str,
        inner: Arc<dyn Decorator<R>>,
    },
    Handler {
        handler: HandlerType,
        inner: Arc<dyn Handler<R>>,
    },
}

impl<R: Request> Link<R> {
    fn name(&self) -> &'static str {
        match self {
            Self::Decorator { name, .. } => *name,
            Self::Handler { handler, .. } => handler.name(),
        }
    }
}

/// The rest of a chain, from a decorator's point of view.
pub struct Next<'a, R: Request> {
    links: &'a [Link<R>],
}

impl<R: Request> Clone for Next<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Request> Copy for Next<'_, R> {}

impl<'a, R: Request> Next<'a, R> {
    /// Runs the remaining links. A `Next` can be run more than once, which is
    /// how the retry decorator re-executes the handler.
    pub fn run(self, request: &'a R, ctx: &'a RequestContext) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            let Some((link, rest)) = self.links.split_first() else {
                return Ok(());
            };
            let next = Next { links: rest };
            match link {
                Link::Decorator { inner, .. } => inner.handle(request, ctx, next).await,
                Link::Handler { inner, .. } => {
                    inner.handle(request, ctx).await?;
                    next.run(request, ctx).await
                }
            }
        })
    }

    /// Number of links left to run.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.links.len()
    }
}

/// A built chain around one handler.
pub struct Pipeline<R: Request> {
    handler: HandlerType,
    links: Vec<Link<R>>,
}

impl<R: Request> Pipeline<R> {
    pub(crate) fn new(handler: HandlerType, links: Vec<Link<R>>) -> Self {
        Self { handler, links }
    }

    #[must_use]
    pub fn handler(&self) -> HandlerType {
        self.handler
    }

    /// Link names in execution order.
    #[must_use]
    pub fn describe(&self) -> Vec<&'static str> {
        self.links.iter().map(Link::name).collect()
    }

    /// Runs the chain for `request`.
    ///
    /// # Errors
    ///
    /// Returns whatever the first failing link returns.
    pub async fn dispatch(&self, request: &R, ctx: &RequestContext) -> Result<(), DispatchError> {
        Next { links: &self.links }.run(request, ctx).await
    }
}
