use std::any::type_name;
use std::sync::Arc;

use courier_core::{Producer, Publication, Request};
use dashmap::DashMap;

use crate::error::DispatchError;

/// Producers by the topic of their publication.
#[derive(Default)]
pub struct ProducerRegistry {
    producers: DashMap<String, Arc<dyn Producer>>,
}

impl ProducerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `producer` under its publication topic, replacing any producer on that topic.
    pub fn add(&self, producer: Arc<dyn Producer>) {
        self.producers
            .insert(producer.publication().topic.clone(), producer);
    }

    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when no producer publishes to `topic`.
    pub fn lookup(&self, topic: &str) -> Result<Arc<dyn Producer>, DispatchError> {
        self.producers
            .get(topic)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| {
                DispatchError::configuration(format!("no producer was registered for topic {topic}"))
            })
    }

    /// The publication declared for request type `R`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when no publication carries `R`.
    pub fn publication_for<R: Request>(&self) -> Result<Publication, DispatchError> {
        let wanted = type_name::<R>();
        self.producers
            .iter()
            .find(|p| p.publication().request_type == Some(wanted))
            .map(|p| p.publication().clone())
            .ok_or_else(|| {
                DispatchError::configuration(format!("no publication was registered for {wanted}"))
            })
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.producers.iter().map(|p| p.key().clone()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryProducer, InternalBus};
    use crate::test_support::{Ping, Pinged};

    #[test]
    fn finds_producers_by_topic_and_request_type() {
        let bus = InternalBus::new();
        let registry = ProducerRegistry::new();
        registry.add(Arc::new(InMemoryProducer::new(
            Arc::clone(&bus),
            Publication::for_request::<Ping>("pings"),
        )));

        assert!(registry.lookup("pings").is_ok());
        assert!(registry.lookup("other").err().unwrap().is_configuration());
        assert_eq!(registry.publication_for::<Ping>().unwrap().topic, "pings");
        assert!(registry.publication_for::<Pinged>().unwrap_err().is_configuration());
    }
}
