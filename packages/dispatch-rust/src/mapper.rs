//! Mapper lookup for outgoing requests and inbound routing for pumped messages.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use courier_core::{JsonMessageMapper, Message, MessageKind, MessageMapper, Request, RequestContext};
use dashmap::DashMap;

use crate::error::DispatchError;
use crate::pipeline::BoxFuture;
use crate::processor::CommandProcessor;

/// Type-erased entry point that decodes a message as one request type and
/// dispatches it.
pub(crate) type InboundRoute = for<'a> fn(
    &'a CommandProcessor,
    Message,
    RequestContext,
) -> BoxFuture<'a, Result<(), DispatchError>>;

fn route<'a, R: Request>(
    processor: &'a CommandProcessor,
    message: Message,
    ctx: RequestContext,
) -> BoxFuture<'a, Result<(), DispatchError>> {
    Box::pin(async move {
        let mapper = processor.mappers().mapper::<R>()?;
        let request = mapper
            .to_request(&message)
            .map_err(|source| DispatchError::Mapping {
                message_id: message.id().clone(),
                source,
            })?;
        let kind = message.kind();
        let ctx = ctx.from_message(message);
        match kind {
            MessageKind::Command => processor.send_with_context(&request, &ctx).await,
            _ => processor.publish_with_context(&request, &ctx).await,
        }
    })
}

/// Registered mappers, keyed by request type.
///
/// Registering a mapper also makes the request type routable by name, so a
/// pump can turn a message for that type back into a dispatch.
#[derive(Default)]
pub struct MessageMapperRegistry {
    mappers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    routes: DashMap<&'static str, InboundRoute>,
}

impl MessageMapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `mapper` for `R`, replacing any previous one.
    pub fn register<R: Request>(&self, mapper: impl MessageMapper<R>) {
        let mapper: Arc<dyn MessageMapper<R>> = Arc::new(mapper);
        self.mappers.insert(TypeId::of::<R>(), Arc::new(mapper));
        self.routes.insert(type_name::<R>(), route::<R>);
    }

    /// Registers a [`JsonMessageMapper`] producing command messages.
    pub fn register_json_command<R: Request>(&self) {
        self.register(JsonMessageMapper::<R>::command());
    }

    /// Registers a [`JsonMessageMapper`] producing event messages.
    pub fn register_json_event<R: Request>(&self) {
        self.register(JsonMessageMapper::<R>::event());
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when no mapper is registered for `R`.
    pub fn mapper<R: Request>(&self) -> Result<Arc<dyn MessageMapper<R>>, DispatchError> {
        self.mappers
            .get(&TypeId::of::<R>())
            .and_then(|entry| {
                entry
                    .value()
                    .downcast_ref::<Arc<dyn MessageMapper<R>>>()
                    .cloned()
            })
            .ok_or_else(|| {
                DispatchError::configuration(format!(
                    "no message mapper was registered for {}",
                    type_name::<R>()
                ))
            })
    }

    #[must_use]
    pub fn contains<R: Request>(&self) -> bool {
        self.mappers.contains_key(&TypeId::of::<R>())
    }

    /// Whether messages for the request type `name` can be routed.
    #[must_use]
    pub fn is_routable(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub(crate) fn route(&self, name: &str) -> Option<InboundRoute> {
        self.routes.get(name).map(|r| *r.value())
    }
}
