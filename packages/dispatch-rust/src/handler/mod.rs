//! Request handlers, their type identity, and how they are registered and created.

pub mod factory;
pub mod registry;

use std::any::{type_name, TypeId};
use std::fmt;

use async_trait::async_trait;
use courier_core::{Request, RequestContext};

use crate::error::DispatchError;

pub use factory::{HandlerFactory, SimpleHandlerFactory};
pub use registry::{HandlerRegistration, HandlerResolver, SubscriberRegistry};

/// Business logic for requests of type `R`.
#[async_trait]
pub trait Handler<R: Request>: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// Return [`DispatchError::Defer`] to ask a message pump to redeliver the
    /// message later; any other error propagates to the dispatching caller.
    async fn handle(&self, request: &R, ctx: &RequestContext) -> Result<(), DispatchError>;
}

/// Identity of a handler implementation, used as the key for factories,
/// resolvers, and inbox context keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    #[must_use]
    pub fn of<H: 'static>() -> Self {
        Self {
            id: TypeId::of::<H>(),
            name: type_name::<H>(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
