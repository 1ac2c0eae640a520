use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;

use super::HandlerType;

/// Type-erased handler instance as returned by a [`HandlerFactory`].
pub type HandlerInstance = Arc<dyn Any + Send + Sync>;

pub(crate) type Constructor = Arc<dyn Fn() -> HandlerInstance + Send + Sync>;

/// Creates handler instances on demand.
///
/// The pipeline builder asks for a fresh instance on every build and downcasts
/// it to the concrete handler type recorded at registration, so a factory
/// backed by a container can hand out scoped instances.
pub trait HandlerFactory: Send + Sync {
    /// Creates an instance of `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory does not know how to build `handler`.
    fn create(&self, handler: &HandlerType) -> anyhow::Result<HandlerInstance>;
}

/// Factory backed by registered constructor closures.
#[derive(Default)]
pub struct SimpleHandlerFactory {
    constructors: DashMap<TypeId, Constructor>,
}

impl SimpleHandlerFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor that builds a new `H` per request.
    pub fn register<H, F>(&self, constructor: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.constructors.insert(
            TypeId::of::<H>(),
            Arc::new(move || Arc::new(constructor()) as HandlerInstance),
        );
    }

    /// Registers a shared instance handed out on every request.
    pub fn register_instance<H: Send + Sync + 'static>(&self, instance: Arc<H>) {
        self.constructors.insert(
            TypeId::of::<H>(),
            Arc::new(move || Arc::clone(&instance) as HandlerInstance),
        );
    }

    #[must_use]
    pub fn contains(&self, handler: &HandlerType) -> bool {
        self.constructors.contains_key(&handler.id())
    }
}

impl HandlerFactory for SimpleHandlerFactory {
    fn create(&self, handler: &HandlerType) -> anyhow::Result<HandlerInstance> {
        let constructor = self
            .constructors
            .get(&handler.id())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| anyhow::anyhow!("no constructor registered for {handler}"))?;
        Ok(constructor())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Counter(u32);

    #[test]
    fn constructor_runs_per_create() {
        let built = Arc::new(AtomicU32::new(0));
        let factory = SimpleHandlerFactory::new();
        let counter = Arc::clone(&built);
        factory.register(move || Counter(counter.fetch_add(1, Ordering::SeqCst)));

        let handler = HandlerType::of::<Counter>();
        let first = factory.create(&handler).unwrap().downcast::<Counter>().unwrap();
        let second = factory.create(&handler).unwrap().downcast::<Counter>().unwrap();

        assert_eq!(first.0, 0);
        assert_eq!(second.0, 1);
    }

    #[test]
    fn shared_instance_is_reused() {
        let factory = SimpleHandlerFactory::new();
        let instance = Arc::new(Counter(7));
        factory.register_instance(Arc::clone(&instance));

        let created = factory
            .create(&HandlerType::of::<Counter>())
            .unwrap()
            .downcast::<Counter>()
            .unwrap();
        assert!(Arc::ptr_eq(&created, &instance));
    }

    #[test]
    fn unknown_handler_is_an_error() {
        let factory = SimpleHandlerFactory::new();
        let err = factory.create(&HandlerType::of::<Counter>()).unwrap_err();
        assert!(err.to_string().contains("Counter"));
    }
}
