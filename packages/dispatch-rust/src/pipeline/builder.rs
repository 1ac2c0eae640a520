//! Resolves a request type to its handler chains.
//!
//! The resolved plan (which handlers, which decorators, in which order) is
//! cached per request type. Handler and decorator instances are created fresh
//! on every build, so a handler factory can hand out scoped instances.

use std::any::{type_name, Any, TypeId};
use std::cmp::Reverse;
use std::sync::Arc;

use courier_core::{Request, RequestContext};
use dashmap::DashMap;

use super::decorators::inbox;
use super::{DecoratorDescriptor, Link, Pipeline, PipelineServices, Timing};
use crate::config::InboxConfiguration;
use crate::error::DispatchError;
use crate::handler::{HandlerFactory, HandlerRegistration, HandlerResolver, SubscriberRegistry};

/// How many handlers a dispatch expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// A command: exactly one handler.
    Send,
    /// An event: any number of handlers, including none.
    Publish,
}

struct PlannedHandler<R: Request> {
    registration: HandlerRegistration<R>,
    before: Vec<DecoratorDescriptor<R>>,
    after: Vec<DecoratorDescriptor<R>>,
}

struct ChainPlan<R: Request> {
    handlers: Vec<PlannedHandler<R>>,
    resolver: Option<HandlerResolver<R>>,
}

/// Builds [`Pipeline`]s from the registry, the handler factory, and the
/// decorator collaborators.
pub struct PipelineBuilder {
    registry: Arc<SubscriberRegistry>,
    factory: Arc<dyn HandlerFactory>,
    services: PipelineServices,
    inbox_config: Option<InboxConfiguration>,
    cache: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        factory: Arc<dyn HandlerFactory>,
        services: PipelineServices,
        inbox_config: Option<InboxConfiguration>,
    ) -> Self {
        Self {
            registry,
            factory,
            services,
            inbox_config,
            cache: DashMap::new(),
        }
    }

    /// Builds one pipeline per handler that should see `request`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when a [`DispatchMode::Send`]
    /// resolves to zero or several handlers, when the factory cannot create a
    /// handler, or when a decorator cannot be built (for example a missing policy).
    pub fn build<R: Request>(
        &self,
        request: &R,
        ctx: &RequestContext,
        mode: DispatchMode,
    ) -> Result<Vec<Pipeline<R>>, DispatchError> {
        let plan = self.plan::<R>();
        let selected: Vec<&PlannedHandler<R>> = match &plan.resolver {
            Some(resolver) => resolver(request, ctx)
                .and_then(|chosen| {
                    plan.handlers
                        .iter()
                        .find(|h| h.registration.handler() == chosen)
                })
                .into_iter()
                .collect(),
            None => plan.handlers.iter().collect(),
        };

        if mode == DispatchMode::Send {
            match selected.len() {
                0 => {
                    return Err(DispatchError::configuration(format!(
                        "no command handler was found for {}",
                        type_name::<R>()
                    )))
                }
                1 => {}
                n => {
                    return Err(DispatchError::configuration(format!(
                        "{n} handlers were found for the command {}, a command must have exactly one handler",
                        type_name::<R>()
                    )))
                }
            }
        }

        selected
            .into_iter()
            .map(|planned| self.assemble(planned))
            .collect()
    }

    /// Forgets every cached plan. Needed after registrations change.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of request types with a cached plan.
    #[must_use]
    pub fn cached_plans(&self) -> usize {
        self.cache.len()
    }

    fn plan<R: Request>(&self) -> Arc<ChainPlan<R>> {
        let key = TypeId::of::<R>();
        if let Some(plan) = self
            .cache
            .get(&key)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<ChainPlan<R>>().ok())
        {
            return plan;
        }
        let plan = Arc::new(self.resolve_plan::<R>());
        self.cache
            .insert(key, Arc::clone(&plan) as Arc<dyn Any + Send + Sync>);
        plan
    }

    fn resolve_plan<R: Request>(&self) -> ChainPlan<R> {
        let routes = self.registry.routes::<R>().unwrap_or_default();
        let handlers = routes
            .registrations
            .into_iter()
            .map(|registration| self.order_decorators(registration))
            .collect();
        ChainPlan {
            handlers,
            resolver: routes.resolver,
        }
    }

    fn order_decorators<R: Request>(&self, registration: HandlerRegistration<R>) -> PlannedHandler<R> {
        let mut declared: Vec<DecoratorDescriptor<R>> = registration.decorators().to_vec();

        if let Some(config) = &self.inbox_config {
            if config.auto_apply && !registration.skips_inbox() && !registration.declares_inbox() {
                let key = config
                    .context_key
                    .clone()
                    .unwrap_or_else(|| registration.handler().name().to_string());
                declared.insert(0, inbox::descriptor(0, config.action, key));
            }
        }

        // Stable sort: equal steps keep declaration order.
        declared.sort_by_key(DecoratorDescriptor::step);
        let (before, mut after): (Vec<_>, Vec<_>) = declared
            .into_iter()
            .partition(|d| d.timing() == Timing::Before);
        // After decorators unwind from the handler outwards: highest step first.
        after.sort_by_key(|d| Reverse(d.step()));

        PlannedHandler {
            registration,
            before,
            after,
        }
    }

    fn assemble<R: Request>(&self, planned: &PlannedHandler<R>) -> Result<Pipeline<R>, DispatchError> {
        let handler_type = planned.registration.handler();
        let instance = match self.factory.create(&handler_type) {
            Ok(instance) => instance,
            Err(e) => planned.registration.construct().ok_or_else(|| {
                DispatchError::configuration(format!("could not create handler {handler_type}: {e}"))
            })?,
        };
        let handler = planned.registration.instantiate(instance).ok_or_else(|| {
            DispatchError::configuration(format!(
                "handler factory returned an instance that is not a {handler_type}"
            ))
        })?;

        let mut links = Vec::with_capacity(planned.before.len() + planned.after.len() + 1);
        for descriptor in &planned.before {
            links.push(Link::Decorator {
                name: descriptor.name(),
                inner: descriptor.build(&self.services)?,
            });
        }
        links.push(Link::Handler {
            handler: handler_type,
            inner: handler,
        });
        for descriptor in &planned.after {
            links.push(Link::Decorator {
                name: descriptor.name(),
                inner: descriptor.build(&self.services)?,
            });
        }

        let pipeline = Pipeline::new(handler_type, links);
        tracing::debug!(
            request_type = type_name::<R>(),
            handler = handler_type.name(),
            chain = ?pipeline.describe(),
            "built pipeline"
        );
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::RequestContext;

    use super::*;
    use crate::handler::{HandlerRegistration, HandlerType, SimpleHandlerFactory};
    use crate::pipeline::decorators::OnceOnlyAction;
    use crate::test_support::{
        builder_with, call_log, services, Ping, PingHandler, RecordingHandler, StepDecorator,
    };

    #[tokio::test]
    async fn before_and_after_steps_wrap_the_handler() {
        let log = call_log();
        let registry = Arc::new(SubscriberRegistry::new());
        let validation = log.clone();
        let logging = log.clone();
        registry.add(
            HandlerRegistration::<Ping>::new::<RecordingHandler>()
                .decorate(DecoratorDescriptor::from_fn(2, Timing::After, "logging", move || {
                    StepDecorator::new("logging", logging.clone())
                }))
                .decorate(DecoratorDescriptor::from_fn(1, Timing::Before, "validation", move || {
                    StepDecorator::new("validation", validation.clone())
                })),
        );
        let factory = SimpleHandlerFactory::new();
        let handler_log = log.clone();
        factory.register(move || RecordingHandler::new(handler_log.clone()));
        let builder = builder_with(registry, factory, None);

        let pipelines = builder
            .build(&Ping::new("x"), &RequestContext::default(), DispatchMode::Send)
            .unwrap();
        assert_eq!(pipelines.len(), 1);
        pipelines[0]
            .dispatch(&Ping::new("x"), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(log.entries(), vec!["validation", "handler", "logging"]);
    }

    #[tokio::test]
    async fn after_decorators_unwind_from_the_highest_step() {
        let log = call_log();
        let registry = Arc::new(SubscriberRegistry::new());
        let first = log.clone();
        let second = log.clone();
        registry.add(
            HandlerRegistration::<Ping>::new::<RecordingHandler>()
                .decorate(DecoratorDescriptor::from_fn(1, Timing::After, "audit", move || {
                    StepDecorator::new("audit", first.clone())
                }))
                .decorate(DecoratorDescriptor::from_fn(2, Timing::After, "metrics", move || {
                    StepDecorator::new("metrics", second.clone())
                })),
        );
        let factory = SimpleHandlerFactory::new();
        let handler_log = log.clone();
        factory.register(move || RecordingHandler::new(handler_log.clone()));
        let builder = builder_with(registry, factory, None);

        let ctx = RequestContext::default();
        let mut pipelines = builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).unwrap();
        let pipeline = pipelines.remove(0);
        pipeline.dispatch(&Ping::new("x"), &ctx).await.unwrap();

        assert_eq!(log.entries(), vec!["handler", "metrics", "audit"]);
    }

    #[test]
    fn send_without_handler_names_the_type() {
        let builder = builder_with(Arc::new(SubscriberRegistry::new()), SimpleHandlerFactory::new(), None);
        let err = builder
            .build(&Ping::new("x"), &RequestContext::default(), DispatchMode::Send)
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Ping"));
    }

    #[test]
    fn send_with_two_handlers_is_rejected_but_publish_is_not() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.register::<Ping, PingHandler>();
        registry.register::<Ping, RecordingHandler>();
        let factory = SimpleHandlerFactory::new();
        factory.register(|| PingHandler);
        factory.register(|| RecordingHandler::new(call_log()));
        let builder = builder_with(registry, factory, None);
        let ctx = RequestContext::default();

        let err = builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).err().unwrap();
        assert!(err.to_string().contains("Ping"));
        assert_eq!(
            builder.build(&Ping::new("x"), &ctx, DispatchMode::Publish).unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn registration_constructor_stands_in_for_the_factory() {
        let log = call_log();
        let registry = Arc::new(SubscriberRegistry::new());
        let handler_log = log.clone();
        registry.register_with::<Ping, _, _>(move || RecordingHandler::new(handler_log.clone()));
        let builder = builder_with(registry, SimpleHandlerFactory::new(), None);

        let ctx = RequestContext::default();
        let mut pipelines = builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).unwrap();
        pipelines.remove(0).dispatch(&Ping::new("x"), &ctx).await.unwrap();
        assert_eq!(log.entries(), vec!["handler"]);
    }

    #[tokio::test]
    async fn factory_entry_wins_over_registration_constructor() {
        let from_factory = call_log();
        let from_registration = call_log();
        let registry = Arc::new(SubscriberRegistry::new());
        let registered = from_registration.clone();
        registry.register_with::<Ping, _, _>(move || RecordingHandler::new(registered.clone()));
        let factory = SimpleHandlerFactory::new();
        let built = from_factory.clone();
        factory.register(move || RecordingHandler::new(built.clone()));
        let builder = builder_with(registry, factory, None);

        let ctx = RequestContext::default();
        let mut pipelines = builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).unwrap();
        pipelines.remove(0).dispatch(&Ping::new("x"), &ctx).await.unwrap();
        assert_eq!(from_factory.entries(), vec!["handler"]);
        assert!(from_registration.entries().is_empty());
    }

    #[test]
    fn publish_tolerates_no_handlers() {
        let builder = builder_with(Arc::new(SubscriberRegistry::new()), SimpleHandlerFactory::new(), None);
        let pipelines = builder
            .build(&Ping::new("x"), &RequestContext::default(), DispatchMode::Publish)
            .unwrap();
        assert!(pipelines.is_empty());
    }

    #[test]
    fn plans_are_cached_until_cleared() {
        let registry = Arc::new(SubscriberRegistry::new());
        let factory = SimpleHandlerFactory::new();
        factory.register(|| PingHandler);
        let builder = builder_with(Arc::clone(&registry), factory, None);
        let ctx = RequestContext::default();

        assert!(builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).is_err());
        assert_eq!(builder.cached_plans(), 1);

        // The cached empty plan hides the late registration until the cache is cleared.
        registry.register::<Ping, PingHandler>();
        assert!(builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).is_err());
        builder.clear_cache();
        assert!(builder.build(&Ping::new("x"), &ctx, DispatchMode::Send).is_ok());
    }

    #[test]
    fn resolver_picks_among_candidates() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.add_resolver(
            vec![
                HandlerRegistration::<Ping>::new::<PingHandler>(),
                HandlerRegistration::<Ping>::new::<RecordingHandler>(),
            ],
            |ping: &Ping, _ctx: &RequestContext| {
                if ping.value == "record" {
                    Some(HandlerType::of::<RecordingHandler>())
                } else if ping.value == "ping" {
                    Some(HandlerType::of::<PingHandler>())
                } else {
                    None
                }
            },
        );
        let factory = SimpleHandlerFactory::new();
        factory.register(|| PingHandler);
        factory.register(|| RecordingHandler::new(call_log()));
        let builder = builder_with(registry, factory, None);
        let ctx = RequestContext::default();

        let chosen = builder.build(&Ping::new("record"), &ctx, DispatchMode::Send).unwrap();
        assert_eq!(chosen[0].handler(), HandlerType::of::<RecordingHandler>());
        let chosen = builder.build(&Ping::new("ping"), &ctx, DispatchMode::Send).unwrap();
        assert_eq!(chosen[0].handler(), HandlerType::of::<PingHandler>());
        assert!(builder.build(&Ping::new("other"), &ctx, DispatchMode::Send).is_err());
    }

    #[test]
    fn global_inbox_configuration_guards_every_handler() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.register::<Ping, PingHandler>();
        let factory = SimpleHandlerFactory::new();
        factory.register(|| PingHandler);
        let inbox_config = InboxConfiguration {
            action: OnceOnlyAction::Warn,
            auto_apply: true,
            context_key: None,
        };
        let builder = PipelineBuilder::new(
            registry,
            Arc::new(factory),
            services(Some(Arc::new(crate::memory::InMemoryInbox::new()))),
            Some(inbox_config),
        );

        let pipelines = builder
            .build(&Ping::new("x"), &RequestContext::default(), DispatchMode::Send)
            .unwrap();
        assert_eq!(pipelines[0].describe()[0], inbox::NAME);
    }

    #[test]
    fn opted_out_handler_is_not_guarded() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.add(HandlerRegistration::<Ping>::new::<PingHandler>().without_inbox());
        let factory = SimpleHandlerFactory::new();
        factory.register(|| PingHandler);
        let builder = PipelineBuilder::new(
            registry,
            Arc::new(factory),
            services(None),
            Some(InboxConfiguration {
                action: OnceOnlyAction::Throw,
                auto_apply: true,
                context_key: None,
            }),
        );

        let pipelines = builder
            .build(&Ping::new("x"), &RequestContext::default(), DispatchMode::Send)
            .unwrap();
        assert_eq!(pipelines[0].describe().len(), 1);
    }
}
