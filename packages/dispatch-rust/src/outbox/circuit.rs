use std::collections::HashMap;

use parking_lot::Mutex;

/// Keeps topics whose producer recently failed out of sweeps.
///
/// A tripped topic stays excluded for a fixed number of sweeps; each sweep
/// calls [`cool_down`](Self::cool_down) once.
#[derive(Debug)]
pub struct TopicCircuitBreaker {
    cooldown: u32,
    tripped: Mutex<HashMap<String, u32>>,
}

impl TopicCircuitBreaker {
    #[must_use]
    pub fn new(cooldown: u32) -> Self {
        Self {
            cooldown,
            tripped: Mutex::new(HashMap::new()),
        }
    }

    pub fn trip(&self, topic: &str) {
        if self.cooldown > 0 {
            self.tripped.lock().insert(topic.to_string(), self.cooldown);
        }
    }

    /// Counts one sweep against every tripped topic, releasing those that are done.
    pub fn cool_down(&self) {
        self.tripped.lock().retain(|_, remaining| {
            *remaining = remaining.saturating_sub(1);
            *remaining > 0
        });
    }

    #[must_use]
    pub fn is_tripped(&self, topic: &str) -> bool {
        self.tripped.lock().contains_key(topic)
    }

    #[must_use]
    pub fn tripped_topics(&self) -> Vec<String> {
        self.tripped.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tripped_topic_recovers_after_cooldown() {
        let breaker = TopicCircuitBreaker::new(2);
        breaker.trip("orders");
        assert_eq!(breaker.tripped_topics(), vec!["orders".to_string()]);

        breaker.cool_down();
        assert!(breaker.is_tripped("orders"));
        breaker.cool_down();
        assert!(!breaker.is_tripped("orders"));
    }

    #[test]
    fn zero_cooldown_never_trips() {
        let breaker = TopicCircuitBreaker::new(0);
        breaker.trip("orders");
        assert!(breaker.tripped_topics().is_empty());
    }
}
