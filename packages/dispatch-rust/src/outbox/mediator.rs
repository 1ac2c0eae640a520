//! Stages outgoing messages in the outbox and moves them to producers.

use std::sync::Arc;

use courier_core::{
    BoxTransaction, ClockSource, Id, Message, Outbox, OutboxEntry, OutstandingQuery, Request,
    TransactionProvider,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::circuit::TopicCircuitBreaker;
use super::producers::ProducerRegistry;
use crate::config::OutboxConfig;
use crate::error::DispatchError;
use crate::mapper::MessageMapperRegistry;
use crate::policy::{PolicyRegistry, RETRY_POLICY};

/// Result of a [`clear`](OutboxProducerMediator::clear).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClearReport {
    /// Sent and stamped by this clear.
    pub dispatched: Vec<Id>,
    /// Already dispatched before this clear, or stamped by a concurrent one.
    pub skipped: Vec<Id>,
    /// Left outstanding because the send failed.
    pub failed: Vec<Id>,
}

/// Result of a [`sweep`](OutboxProducerMediator::sweep).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// The sweep did not run because a clear held the outbox.
    pub skipped: bool,
    /// Outstanding entries the sweep picked up.
    pub found: usize,
    pub dispatched: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct OutstandingCount {
    count: usize,
    checked_at: Option<u64>,
}

/// Deposits requests into the outbox and clears them through producers.
///
/// One clear or sweep works the outbox at a time. Sends run under the
/// [`RETRY_POLICY`] retry policy; a send that still fails trips its topic so
/// the following sweeps leave it alone for a while.
pub struct OutboxProducerMediator {
    outbox: Arc<dyn Outbox>,
    producers: Arc<ProducerRegistry>,
    mappers: Arc<MessageMapperRegistry>,
    policies: Arc<PolicyRegistry>,
    clock: Arc<dyn ClockSource>,
    transactions: Option<Arc<dyn TransactionProvider>>,
    config: OutboxConfig,
    breaker: TopicCircuitBreaker,
    clear_lock: tokio::sync::Mutex<()>,
    outstanding: Mutex<OutstandingCount>,
}

impl OutboxProducerMediator {
    #[must_use]
    pub fn new(
        outbox: Arc<dyn Outbox>,
        producers: Arc<ProducerRegistry>,
        mappers: Arc<MessageMapperRegistry>,
        policies: Arc<PolicyRegistry>,
        clock: Arc<dyn ClockSource>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            breaker: TopicCircuitBreaker::new(config.topic_cooldown_sweeps),
            outbox,
            producers,
            mappers,
            policies,
            clock,
            transactions: None,
            config,
            clear_lock: tokio::sync::Mutex::new(()),
            outstanding: Mutex::new(OutstandingCount::default()),
        }
    }

    /// Lets deposits enlist in the provider's current transaction.
    #[must_use]
    pub fn with_transactions(mut self, provider: Arc<dyn TransactionProvider>) -> Self {
        self.transactions = Some(provider);
        self
    }

    #[must_use]
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> &TopicCircuitBreaker {
        &self.breaker
    }

    // -----------------------------------------------------------------------
    // Deposit
    // -----------------------------------------------------------------------

    /// Maps `request` with its registered mapper onto its publication.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when the request type has no
    /// publication or mapper, and [`DispatchError::Mapping`] when mapping fails.
    pub fn create_message<R: Request>(&self, request: &R) -> Result<Message, DispatchError> {
        let publication = self.producers.publication_for::<R>()?;
        let mapper = self.mappers.mapper::<R>()?;
        mapper
            .to_message(request, &publication)
            .map_err(|source| DispatchError::Mapping {
                message_id: request.id().clone(),
                source,
            })
    }

    /// Writes the message for `request` to the outbox and returns its id.
    ///
    /// With `enlist`, the write joins the ambient transaction when one is open
    /// and becomes visible only when that transaction commits.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::OutboxLimitReached`] when too many entries are
    /// outstanding, a mapping error, or the store's failure.
    pub async fn deposit<R: Request>(&self, request: &R, enlist: bool) -> Result<Id, DispatchError> {
        self.check_outstanding().await?;
        let message = self.create_message(request)?;
        self.write(message, self.transaction(enlist)).await
    }

    /// Deposits every request in `requests`, in one transaction when enlisting.
    ///
    /// # Errors
    ///
    /// Fails on the first request that cannot be deposited. With a transaction,
    /// nothing becomes visible unless it commits.
    pub async fn deposit_batch<R: Request>(
        &self,
        requests: &[R],
        enlist: bool,
    ) -> Result<Vec<Id>, DispatchError> {
        self.check_outstanding().await?;
        let messages = requests
            .iter()
            .map(|request| self.create_message(request))
            .collect::<Result<Vec<_>, _>>()?;
        let transaction = self.transaction(enlist);
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.write(message, transaction.clone()).await?);
        }
        debug!(count = ids.len(), "deposited batch");
        Ok(ids)
    }

    fn transaction(&self, enlist: bool) -> Option<Arc<dyn BoxTransaction>> {
        if enlist {
            self.transactions.as_ref().and_then(|p| p.current())
        } else {
            None
        }
    }

    async fn write(
        &self,
        message: Message,
        transaction: Option<Arc<dyn BoxTransaction>>,
    ) -> Result<Id, DispatchError> {
        let id = message.id().clone();
        let topic = message.header.topic.clone();
        let transaction_id = transaction.as_ref().map(|t| t.id().to_string());
        self.outbox
            .add(OutboxEntry::new(message, self.clock.now()), transaction)
            .await?;
        {
            let mut outstanding = self.outstanding.lock();
            if transaction_id.is_some() {
                // Lands only on commit; recount from the store next time.
                outstanding.checked_at = None;
            } else {
                outstanding.count += 1;
            }
        }
        debug!(message_id = %id, topic = %topic, transaction = ?transaction_id, "deposited");
        Ok(id)
    }

    /// Refreshes the outstanding count when stale and enforces the limit.
    async fn check_outstanding(&self) -> Result<(), DispatchError> {
        let Some(limit) = self.config.max_outstanding else {
            return Ok(());
        };
        let now = self.clock.now();
        let interval = u64::try_from(self.config.outstanding_check_interval.as_millis())
            .unwrap_or(u64::MAX);
        let stale = self
            .outstanding
            .lock()
            .checked_at
            .is_none_or(|at| now.saturating_sub(at) >= interval);
        if stale {
            let count = self.outbox.outstanding_count().await?;
            debug!(count, "refreshed outstanding count");
            *self.outstanding.lock() = OutstandingCount {
                count,
                checked_at: Some(now),
            };
        }
        let outstanding = self.outstanding.lock().count;
        if outstanding > limit {
            return Err(DispatchError::OutboxLimitReached { outstanding, limit });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Clear
    // -----------------------------------------------------------------------

    /// Sends the entries named by `ids` and marks the successful ones dispatched.
    ///
    /// Waits for any running clear or sweep. A failed send leaves its entry
    /// outstanding for the sweeper. With `confirm`, send failures are returned
    /// after every id has been tried; without it they are only logged.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::OutboxEntryNotFound`] for an unknown id, and
    /// with `confirm` the send failures.
    pub async fn clear(&self, ids: &[Id], confirm: bool) -> Result<ClearReport, DispatchError> {
        let _clearing = self.clear_lock.lock().await;
        let mut report = ClearReport::default();
        let mut errors = Vec::new();

        for id in ids {
            let entry = self
                .outbox
                .get(id)
                .await?
                .ok_or_else(|| DispatchError::OutboxEntryNotFound(id.clone()))?;
            if entry.is_dispatched() {
                report.skipped.push(id.clone());
                continue;
            }
            match self.dispatch_entry(&entry).await {
                Ok(true) => report.dispatched.push(id.clone()),
                Ok(false) => report.skipped.push(id.clone()),
                Err(error) => {
                    warn!(message_id = %id, topic = %entry.topic(), error = %error, "clear failed to send");
                    report.failed.push(id.clone());
                    errors.push(error);
                }
            }
        }

        if confirm && !errors.is_empty() {
            return Err(if errors.len() == 1 {
                errors.remove(0)
            } else {
                DispatchError::Aggregate(errors)
            });
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    /// Re-sends outstanding entries older than the configured minimum age.
    ///
    /// Skips, without waiting, when a clear is running. Topics tripped by
    /// earlier failures are left out until they cool down.
    ///
    /// # Errors
    ///
    /// Returns the store's failure when outstanding entries cannot be read.
    pub async fn sweep(&self) -> Result<SweepReport, DispatchError> {
        let Ok(_clearing) = self.clear_lock.try_lock() else {
            debug!("clear in progress, skipping sweep");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        self.breaker.cool_down();
        let query = OutstandingQuery {
            min_age_ms: u64::try_from(self.config.min_age.as_millis()).unwrap_or(u64::MAX),
            max_count: self.config.batch_size,
            excluded_topics: self.breaker.tripped_topics(),
        };
        let entries = self
            .outbox
            .outstanding_messages(&query, self.clock.now())
            .await?;

        let mut report = SweepReport {
            found: entries.len(),
            ..SweepReport::default()
        };
        for entry in &entries {
            if self.breaker.is_tripped(entry.topic()) {
                continue;
            }
            match self.dispatch_entry(entry).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(message_id = %entry.id(), topic = %entry.topic(), error = %error, "sweep failed to send");
                    report.failed += 1;
                }
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                dispatched = report.dispatched,
                failed = report.failed,
                "outbox sweep finished"
            );
        }
        Ok(report)
    }

    /// Sends `message` to its topic's producer without staging it.
    ///
    /// Used for request/reply calls, where the caller waits on the reply and
    /// the outbox adds nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when the topic has no producer,
    /// and [`DispatchError::ChannelFailure`] when the send fails after retries.
    pub async fn send_now(&self, message: &Message) -> Result<(), DispatchError> {
        self.send(message).await
    }

    async fn send(&self, message: &Message) -> Result<(), DispatchError> {
        let producer = self.producers.lookup(&message.header.topic)?;
        let retry = self.policies.retry(RETRY_POLICY)?;
        let delay = std::time::Duration::from_millis(message.header.delay_ms);

        retry
            .execute(|_| {
                let producer = Arc::clone(&producer);
                async move {
                    let result = if delay.is_zero() {
                        producer.send(message).await
                    } else {
                        producer.send_with_delay(message, delay).await
                    };
                    result.map_err(DispatchError::ChannelFailure)
                }
            })
            .await
    }

    /// Sends one entry and stamps it. Returns whether this call did the stamping.
    async fn dispatch_entry(&self, entry: &OutboxEntry) -> Result<bool, DispatchError> {
        let topic = entry.topic().to_string();
        if let Err(error) = self.send(&entry.message).await {
            if !error.is_configuration() {
                metrics::counter!("courier_outbox_send_failures_total", "topic" => topic.clone())
                    .increment(1);
                self.breaker.trip(&topic);
            }
            return Err(error);
        }

        let marked = self
            .outbox
            .mark_dispatched(entry.id(), self.clock.now())
            .await?;
        if marked {
            let mut outstanding = self.outstanding.lock();
            outstanding.count = outstanding.count.saturating_sub(1);
            metrics::counter!("courier_outbox_dispatched_total", "topic" => topic.clone())
                .increment(1);
            debug!(message_id = %entry.id(), topic = %topic, "dispatched");
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::{ManualClock, Producer, Publication};
    use proptest::prelude::*;

    use super::*;
    use crate::memory::{
        InMemoryOutbox, InMemoryProducer, InMemoryTransactionProvider, InternalBus,
    };
    use crate::test_support::{policies, Ping};

    struct Fixture {
        mediator: Arc<OutboxProducerMediator>,
        outbox: InMemoryOutbox,
        bus: Arc<InternalBus>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: OutboxConfig, producer: Option<Arc<dyn Producer>>) -> Fixture {
        let bus = InternalBus::new();
        let outbox = InMemoryOutbox::new();
        let clock = Arc::new(ManualClock::new(10_000));
        let producers = Arc::new(ProducerRegistry::new());
        producers.add(producer.unwrap_or_else(|| {
            Arc::new(InMemoryProducer::new(
                Arc::clone(&bus),
                Publication::for_request::<Ping>("pings"),
            ))
        }));
        let mappers = Arc::new(MessageMapperRegistry::new());
        mappers.register_json_command::<Ping>();
        let registry = policies();
        registry.add_retry(RETRY_POLICY, crate::policy::RetryPolicy::new(0, Default::default()));
        let mediator = OutboxProducerMediator::new(
            Arc::new(outbox.clone()),
            producers,
            mappers,
            registry,
            clock.clone(),
            config,
        );
        Fixture {
            mediator: Arc::new(mediator),
            outbox,
            bus,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(OutboxConfig::default(), None)
    }

    struct BrokenProducer(Publication);

    #[async_trait]
    impl Producer for BrokenProducer {
        fn publication(&self) -> &Publication {
            &self.0
        }

        async fn send(&self, _message: &Message) -> anyhow::Result<()> {
            anyhow::bail!("broker unreachable")
        }

        async fn send_with_delay(&self, message: &Message, _delay: Duration) -> anyhow::Result<()> {
            self.send(message).await
        }
    }

    #[tokio::test]
    async fn deposit_then_clear_sends_once() {
        let f = fixture();
        let ping = Ping::new("x");
        let id = f.mediator.deposit(&ping, false).await.unwrap();
        assert_eq!(&id, &ping.id);
        assert_eq!(f.bus.len("pings"), 0);

        let report = f.mediator.clear(&[id.clone()], true).await.unwrap();
        assert_eq!(report.dispatched, vec![id.clone()]);
        assert_eq!(f.bus.len("pings"), 1);
        assert_eq!(f.outbox.entry(&id).unwrap().dispatched_at, Some(10_000));

        let again = f.mediator.clear(&[id.clone()], true).await.unwrap();
        assert_eq!(again.skipped, vec![id]);
        assert_eq!(f.bus.len("pings"), 1);
    }

    #[tokio::test]
    async fn deposit_without_publication_is_configuration_error() {
        let f = fixture();
        let event = crate::test_support::Pinged::new("x");
        let err = f.mediator.deposit(&event, false).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(f.outbox.is_empty());
    }

    #[tokio::test]
    async fn clear_of_unknown_id_fails() {
        let f = fixture();
        let err = f.mediator.clear(&[Id::from("missing")], false).await.unwrap_err();
        assert!(matches!(err, DispatchError::OutboxEntryNotFound(_)));
    }

    #[tokio::test]
    async fn enlisted_deposit_waits_for_commit() {
        let f = fixture();
        let provider = Arc::new(InMemoryTransactionProvider::new());
        let mediator = OutboxProducerMediator::new(
            Arc::new(f.outbox.clone()),
            Arc::clone(&f.mediator.producers),
            Arc::clone(&f.mediator.mappers),
            Arc::clone(&f.mediator.policies),
            f.clock.clone(),
            OutboxConfig::default(),
        )
        .with_transactions(provider.clone());

        provider.begin();
        let committed = mediator.deposit(&Ping::new("a"), true).await.unwrap();
        assert!(f.outbox.entry(&committed).is_none());
        provider.commit().unwrap();
        assert!(f.outbox.entry(&committed).is_some());

        provider.begin();
        let ids = mediator
            .deposit_batch(&[Ping::new("b"), Ping::new("c")], true)
            .await
            .unwrap();
        provider.rollback();
        assert!(ids.iter().all(|id| f.outbox.entry(id).is_none()));
    }

    #[tokio::test]
    async fn failed_clear_is_silent_unless_confirmed() {
        let f = fixture_with(
            OutboxConfig::default(),
            Some(Arc::new(BrokenProducer(Publication::for_request::<Ping>("pings")))),
        );
        let id = f.mediator.deposit(&Ping::new("x"), false).await.unwrap();

        let report = f.mediator.clear(&[id.clone()], false).await.unwrap();
        assert_eq!(report.failed, vec![id.clone()]);
        assert!(!f.outbox.entry(&id).unwrap().is_dispatched());

        let err = f.mediator.clear(&[id], true).await.unwrap_err();
        assert!(matches!(err, DispatchError::ChannelFailure(_)));
    }

    #[tokio::test]
    async fn sweep_sends_only_old_outstanding_entries() {
        let f = fixture();
        let old = f.mediator.deposit(&Ping::new("old"), false).await.unwrap();
        f.clock.advance(6_000);
        let young = f.mediator.deposit(&Ping::new("young"), false).await.unwrap();

        let report = f.mediator.sweep().await.unwrap();
        assert_eq!((report.found, report.dispatched), (1, 1));
        assert!(f.outbox.entry(&old).unwrap().is_dispatched());
        assert!(!f.outbox.entry(&young).unwrap().is_dispatched());

        let report = f.mediator.sweep().await.unwrap();
        assert_eq!(report.found, 0);
    }

    #[tokio::test]
    async fn failed_topic_is_skipped_until_cooled_down() {
        let config = OutboxConfig {
            topic_cooldown_sweeps: 2,
            ..OutboxConfig::default()
        };
        let f = fixture_with(
            config,
            Some(Arc::new(BrokenProducer(Publication::for_request::<Ping>("pings")))),
        );
        f.mediator.deposit(&Ping::new("x"), false).await.unwrap();
        f.clock.advance(10_000);

        assert_eq!(f.mediator.sweep().await.unwrap().failed, 1);
        assert!(f.mediator.breaker().is_tripped("pings"));
        assert_eq!(f.mediator.sweep().await.unwrap().found, 0);
        assert_eq!(f.mediator.sweep().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn outstanding_limit_blocks_deposits() {
        let config = OutboxConfig {
            max_outstanding: Some(1),
            ..OutboxConfig::default()
        };
        let f = fixture_with(config, None);
        let a = f.mediator.deposit(&Ping::new("a"), false).await.unwrap();
        let b = f.mediator.deposit(&Ping::new("b"), false).await.unwrap();

        let err = f.mediator.deposit(&Ping::new("c"), false).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::OutboxLimitReached { outstanding: 2, limit: 1 }
        ));

        f.mediator.clear(&[a, b], false).await.unwrap();
        f.clock.advance(1_000);
        assert!(f.mediator.deposit(&Ping::new("d"), false).await.is_ok());
    }

    #[tokio::test]
    async fn rolled_back_deposits_do_not_count_as_outstanding() {
        let config = OutboxConfig {
            max_outstanding: Some(1),
            ..OutboxConfig::default()
        };
        let f = fixture_with(config.clone(), None);
        let provider = Arc::new(InMemoryTransactionProvider::new());
        let mediator = OutboxProducerMediator::new(
            Arc::new(f.outbox.clone()),
            Arc::clone(&f.mediator.producers),
            Arc::clone(&f.mediator.mappers),
            Arc::clone(&f.mediator.policies),
            f.clock.clone(),
            config,
        )
        .with_transactions(provider.clone());

        provider.begin();
        mediator.deposit(&Ping::new("a"), true).await.unwrap();
        mediator.deposit(&Ping::new("b"), true).await.unwrap();
        provider.rollback();

        assert!(mediator.deposit(&Ping::new("c"), false).await.is_ok());
        assert!(mediator.deposit(&Ping::new("d"), false).await.is_ok());
        let err = mediator.deposit(&Ping::new("e"), false).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::OutboxLimitReached { outstanding: 2, limit: 1 }
        ));
    }

    #[tokio::test]
    async fn sweep_skips_while_clear_holds_the_outbox() {
        let f = fixture();
        let _held = f.mediator.clear_lock.lock().await;
        assert!(f.mediator.sweep().await.unwrap().skipped);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn concurrent_sweeps_mark_each_entry_once(count in 1usize..20) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let f = fixture();
                let mut ids = Vec::new();
                for i in 0..count {
                    ids.push(f.mediator.deposit(&Ping::new(&i.to_string()), false).await.unwrap());
                }
                f.clock.advance(60_000);

                let first = tokio::spawn({
                    let mediator = Arc::clone(&f.mediator);
                    async move { mediator.sweep().await.unwrap() }
                });
                let second = tokio::spawn({
                    let mediator = Arc::clone(&f.mediator);
                    async move { mediator.sweep().await.unwrap() }
                });
                let (a, b) = (first.await.unwrap(), second.await.unwrap());

                assert_eq!(a.dispatched + b.dispatched, count);
                assert!(f.bus.len("pings") >= count);
                for id in &ids {
                    assert!(f.outbox.entry(id).unwrap().is_dispatched());
                }
            });
        }
    }
}
