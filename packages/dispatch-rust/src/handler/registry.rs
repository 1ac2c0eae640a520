use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{Request, RequestContext};
use dashmap::DashMap;

use super::factory::{Constructor, HandlerInstance};
use super::{Handler, HandlerType};
use crate::pipeline::decorators::{
    circuit_breaker, inbox, logging, monitor, retry, timeout, OnceOnlyAction,
};
use crate::pipeline::{DecoratorDescriptor, Timing};

/// Picks one of the pre-declared candidate handlers by inspecting the request.
pub type HandlerResolver<R> = Arc<dyn Fn(&R, &RequestContext) -> Option<HandlerType> + Send + Sync>;

type Cast<R> = fn(HandlerInstance) -> Option<Arc<dyn Handler<R>>>;

fn cast<R: Request, H: Handler<R>>(instance: HandlerInstance) -> Option<Arc<dyn Handler<R>>> {
    instance
        .downcast::<H>()
        .ok()
        .map(|handler| handler as Arc<dyn Handler<R>>)
}

// ---------------------------------------------------------------------------
// HandlerRegistration
// ---------------------------------------------------------------------------

/// One handler subscribed to request type `R`, with the decorators declared on it.
pub struct HandlerRegistration<R: Request> {
    handler: HandlerType,
    cast: Cast<R>,
    decorators: Vec<DecoratorDescriptor<R>>,
    skip_inbox: bool,
    constructor: Option<Constructor>,
}

impl<R: Request> Clone for HandlerRegistration<R> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler,
            cast: self.cast,
            decorators: self.decorators.clone(),
            skip_inbox: self.skip_inbox,
            constructor: self.constructor.clone(),
        }
    }
}

impl<R: Request> HandlerRegistration<R> {
    /// Registration for handler type `H` with no decorators.
    #[must_use]
    pub fn new<H: Handler<R>>() -> Self {
        Self {
            handler: HandlerType::of::<H>(),
            cast: cast::<R, H>,
            decorators: Vec::new(),
            skip_inbox: false,
            constructor: None,
        }
    }

    /// Registration for the handler `constructor` builds. The constructor is
    /// used when the handler factory has no entry for the handler type.
    #[must_use]
    pub fn with_constructor<H, F>(constructor: F) -> Self
    where
        H: Handler<R>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            constructor: Some(Arc::new(move || Arc::new(constructor()) as HandlerInstance)),
            ..Self::new::<H>()
        }
    }

    /// Declares a decorator around this handler.
    #[must_use]
    pub fn decorate(mut self, descriptor: DecoratorDescriptor<R>) -> Self {
        self.decorators.push(descriptor);
        self
    }

    /// Guards the handler with the inbox (once-only), before it runs.
    ///
    /// `context_key` defaults to the handler's type name.
    #[must_use]
    pub fn with_inbox(self, step: u32, action: OnceOnlyAction, context_key: Option<String>) -> Self {
        let key = context_key.unwrap_or_else(|| self.handler.name().to_string());
        self.decorate(inbox::descriptor(step, action, key))
    }

    /// Opts out of an inbox guard applied globally by the inbox configuration.
    #[must_use]
    pub fn without_inbox(mut self) -> Self {
        self.skip_inbox = true;
        self
    }

    /// Retries the rest of the chain under the named retry policy.
    #[must_use]
    pub fn with_retry(self, step: u32, policy: impl Into<String>) -> Self {
        self.decorate(retry::descriptor(step, policy.into()))
    }

    /// Guards the rest of the chain with the named circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(self, step: u32, policy: impl Into<String>) -> Self {
        self.decorate(circuit_breaker::descriptor(step, policy.into()))
    }

    /// Fails the rest of the chain with [`DispatchError::Timeout`](crate::DispatchError::Timeout)
    /// when it runs longer than `limit`.
    #[must_use]
    pub fn with_timeout(self, step: u32, limit: Duration) -> Self {
        self.decorate(timeout::descriptor(step, limit))
    }

    /// Emits before/after events and timings for the rest of the chain.
    #[must_use]
    pub fn with_monitoring(self, step: u32) -> Self {
        let handler = self.handler.name();
        self.decorate(monitor::descriptor(step, handler))
    }

    /// Logs the request at `timing`.
    #[must_use]
    pub fn with_request_logging(self, step: u32, timing: Timing) -> Self {
        self.decorate(logging::descriptor(step, timing))
    }

    #[must_use]
    pub fn handler(&self) -> HandlerType {
        self.handler
    }

    #[must_use]
    pub fn decorators(&self) -> &[DecoratorDescriptor<R>] {
        &self.decorators
    }

    pub(crate) fn skips_inbox(&self) -> bool {
        self.skip_inbox
    }

    pub(crate) fn declares_inbox(&self) -> bool {
        self.decorators.iter().any(|d| d.name() == inbox::NAME)
    }

    /// Builds an instance with the constructor given at registration, if any.
    pub(crate) fn construct(&self) -> Option<HandlerInstance> {
        self.constructor.as_ref().map(|constructor| constructor())
    }

    /// Downcasts a factory-built instance to this registration's handler.
    pub(crate) fn instantiate(&self, instance: HandlerInstance) -> Option<Arc<dyn Handler<R>>> {
        (self.cast)(instance)
    }
}

// ---------------------------------------------------------------------------
// SubscriberRegistry
// ---------------------------------------------------------------------------

/// Handlers subscribed to one request type.
pub(crate) struct Routes<R: Request> {
    pub(crate) registrations: Vec<HandlerRegistration<R>>,
    pub(crate) resolver: Option<HandlerResolver<R>>,
}

impl<R: Request> Clone for Routes<R> {
    fn clone(&self) -> Self {
        Self {
            registrations: self.registrations.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<R: Request> Default for Routes<R> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            resolver: None,
        }
    }
}

/// Maps request types to their subscribed handlers.
///
/// Populated at startup by explicit registration calls. Handlers for one
/// request type keep their registration order, which is the order `publish`
/// runs them in.
#[derive(Default)]
pub struct SubscriberRegistry {
    routes: DashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `H` to `R` with no decorators.
    pub fn register<R: Request, H: Handler<R>>(&self) {
        self.add(HandlerRegistration::<R>::new::<H>());
    }

    /// Subscribes the handler `constructor` builds to `R`.
    pub fn register_with<R, H, F>(&self, constructor: F)
    where
        R: Request,
        H: Handler<R>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.add(HandlerRegistration::<R>::with_constructor(constructor));
    }

    /// Subscribes a handler. Registering the same handler type twice replaces
    /// the earlier registration in place.
    pub fn add<R: Request>(&self, registration: HandlerRegistration<R>) {
        self.with_routes::<R>(|routes| {
            if let Some(existing) = routes
                .registrations
                .iter_mut()
                .find(|r| r.handler == registration.handler)
            {
                *existing = registration;
            } else {
                routes.registrations.push(registration);
            }
        });
    }

    /// Subscribes a set of candidate handlers chosen per request by `resolver`.
    ///
    /// When the resolver returns a handler type that is not among the
    /// candidates, or `None`, the request resolves to no handler.
    pub fn add_resolver<R, F>(&self, candidates: Vec<HandlerRegistration<R>>, resolver: F)
    where
        R: Request,
        F: Fn(&R, &RequestContext) -> Option<HandlerType> + Send + Sync + 'static,
    {
        self.with_routes::<R>(|routes| {
            routes.registrations = candidates;
            routes.resolver = Some(Arc::new(resolver));
        });
    }

    /// Whether anything is subscribed to `R`.
    #[must_use]
    pub fn is_registered<R: Request>(&self) -> bool {
        self.routes::<R>()
            .is_some_and(|routes| !routes.registrations.is_empty())
    }

    pub(crate) fn routes<R: Request>(&self) -> Option<Routes<R>> {
        self.routes
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.value().downcast_ref::<Routes<R>>().cloned())
    }

    fn with_routes<R: Request>(&self, update: impl FnOnce(&mut Routes<R>)) {
        let mut entry = self
            .routes
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(Routes::<R>::default()));
        if let Some(routes) = entry.value_mut().downcast_mut::<Routes<R>>() {
            update(routes);
        }
    }
}
