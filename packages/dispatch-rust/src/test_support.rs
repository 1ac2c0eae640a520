//! Requests, handlers and pipeline helpers shared by the unit tests.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{Id, Inbox, ManualClock, Request, RequestContext};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::error::DispatchError;
use crate::handler::{Handler, HandlerRegistration, SimpleHandlerFactory, SubscriberRegistry};
use crate::pipeline::{
    Decorator, DispatchMode, Next, Pipeline, PipelineBuilder, PipelineServices,
};
use crate::policy::{BackoffPolicy, CircuitBreakerPolicy, JitterPolicy, PolicyRegistry, RetryPolicy};

/// Retry policy key: three retries, one millisecond apart.
pub const FAST_RETRY: &str = "test.fast_retry";

/// Circuit breaker key: opens after two failures for a minute.
pub const TRIP_AFTER_TWO: &str = "test.trip_after_two";

/// Routes test logs through the test writer, filtered by `COURIER_LOG`
/// (default `warn`). Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("COURIER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Events seen on the current thread while the guard from
/// [`capture_events`] is held, one line per event: the message, its fields
/// as `name=value`, then the enclosing spans as `spans=outer>inner`.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// First event whose message is exactly `message`.
    pub fn find(&self, message: &str) -> Option<String> {
        self.0
            .lock()
            .iter()
            .find(|line| *line == message || line.starts_with(&format!("{message} ")))
            .cloned()
    }
}

struct EventLine {
    message: String,
    fields: String,
}

impl Visit for EventLine {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

impl<S> Layer<S> for EventLog
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let mut line = EventLine {
            message: String::new(),
            fields: String::new(),
        };
        event.record(&mut line);
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            let _ = write!(line.fields, " spans={}", spans.join(">"));
        }
        self.0.lock().push(format!("{}{}", line.message, line.fields));
    }
}

/// Records every event on this thread until the guard drops.
pub fn capture_events() -> (EventLog, DefaultGuard) {
    let log = EventLog::default();
    let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));
    (log, guard)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: Id,
    pub value: String,
}

impl Ping {
    pub fn new(value: &str) -> Self {
        Self {
            id: Id::random(),
            value: value.to_string(),
        }
    }
}

impl Request for Ping {
    fn id(&self) -> &Id {
        &self.id
    }
}

/// An event with any number of subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pinged {
    pub id: Id,
    pub value: String,
}

impl Pinged {
    pub fn new(value: &str) -> Self {
        Self {
            id: Id::random(),
            value: value.to_string(),
        }
    }
}

impl Request for Pinged {
    fn id(&self) -> &Id {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

/// Ordered record of which links ran.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: &str) {
        self.0.lock().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub fn call_log() -> CallLog {
    CallLog::default()
}

/// Number of times a handler ran.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct PingHandler;

#[async_trait]
impl Handler<Ping> for PingHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        Ok(())
    }
}

pub struct RecordingHandler {
    log: CallLog,
}

impl RecordingHandler {
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Handler<Ping> for RecordingHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        self.log.push("handler");
        Ok(())
    }
}

#[async_trait]
impl Handler<Pinged> for RecordingHandler {
    async fn handle(&self, request: &Pinged, _ctx: &RequestContext) -> Result<(), DispatchError> {
        self.log.push(&request.value);
        Ok(())
    }
}

pub struct CountingHandler(pub CallCounter);

#[async_trait]
impl Handler<Ping> for CountingHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        self.0.increment();
        Ok(())
    }
}

pub struct FailingHandler;

#[async_trait]
impl Handler<Ping> for FailingHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        Err(anyhow::anyhow!("boom").into())
    }
}

#[async_trait]
impl Handler<Pinged> for FailingHandler {
    async fn handle(&self, _request: &Pinged, _ctx: &RequestContext) -> Result<(), DispatchError> {
        Err(anyhow::anyhow!("boom").into())
    }
}

pub struct SlowHandler;

#[async_trait]
impl Handler<Ping> for SlowHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }
}

/// Fails with a timeout until its failure budget is spent.
pub struct FlakyHandler {
    calls: CallCounter,
    failures: u32,
}

impl FlakyHandler {
    pub fn new(calls: CallCounter, failures: u32) -> Self {
        Self { calls, failures }
    }
}

#[async_trait]
impl Handler<Ping> for FlakyHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        if self.calls.increment() <= self.failures {
            return Err(DispatchError::Timeout(Duration::from_millis(1)));
        }
        Ok(())
    }
}

/// Defers every delivery.
pub struct DeferringHandler(pub CallCounter);

#[async_trait]
impl Handler<Ping> for DeferringHandler {
    async fn handle(&self, _request: &Ping, _ctx: &RequestContext) -> Result<(), DispatchError> {
        self.0.increment();
        Err(DispatchError::Defer { delay: None })
    }
}

// ---------------------------------------------------------------------------
// Decorators
// ---------------------------------------------------------------------------

/// Records its name, then continues the chain.
pub struct StepDecorator {
    name: &'static str,
    log: CallLog,
}

impl StepDecorator {
    pub fn new(name: &'static str, log: CallLog) -> Self {
        Self { name, log }
    }
}

#[async_trait]
impl<R: Request> Decorator<R> for StepDecorator {
    async fn handle(
        &self,
        request: &R,
        ctx: &RequestContext,
        next: Next<'_, R>,
    ) -> Result<(), DispatchError> {
        self.log.push(self.name);
        next.run(request, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Pipeline helpers
// ---------------------------------------------------------------------------

pub fn policies() -> Arc<PolicyRegistry> {
    let policies = PolicyRegistry::with_defaults();
    policies.add_retry(
        FAST_RETRY,
        RetryPolicy::new(
            3,
            BackoffPolicy {
                first: Duration::from_millis(1),
                max: Duration::from_millis(1),
                factor: 1.0,
                jitter: JitterPolicy::None,
            },
        ),
    );
    policies.add_circuit_breaker(
        TRIP_AFTER_TWO,
        CircuitBreakerPolicy {
            failure_threshold: 2,
            break_duration: Duration::from_secs(60),
        },
    );
    Arc::new(policies)
}

pub fn services(inbox: Option<Arc<dyn Inbox>>) -> PipelineServices {
    PipelineServices {
        inbox,
        policies: policies(),
        clock: Arc::new(ManualClock::new(1_000)),
    }
}

/// Factory knowing the stateless test handlers.
pub fn test_factory() -> SimpleHandlerFactory {
    let factory = SimpleHandlerFactory::new();
    factory.register(|| PingHandler);
    factory.register(|| FailingHandler);
    factory.register(|| SlowHandler);
    factory
}

pub fn builder_with(
    registry: Arc<SubscriberRegistry>,
    factory: SimpleHandlerFactory,
    inbox: Option<Arc<dyn Inbox>>,
) -> PipelineBuilder {
    PipelineBuilder::new(registry, Arc::new(factory), services(inbox), None)
}

/// Builds the single pipeline for `registration`.
pub fn pipeline_with(
    registration: HandlerRegistration<Ping>,
    factory: SimpleHandlerFactory,
    inbox: Option<Arc<dyn Inbox>>,
) -> Pipeline<Ping> {
    let registry = Arc::new(SubscriberRegistry::new());
    registry.add(registration);
    builder_with(registry, factory, inbox)
        .build(&Ping::new("build"), &RequestContext::default(), DispatchMode::Send)
        .unwrap()
        .remove(0)
}

pub fn pipeline_for(registration: HandlerRegistration<Ping>) -> Pipeline<Ping> {
    pipeline_with(registration, test_factory(), None)
}

/// Pipeline around a [`CountingHandler`], with its counter.
pub fn counting_pipeline(
    registration: HandlerRegistration<Ping>,
    inbox: Option<Arc<dyn Inbox>>,
) -> (Pipeline<Ping>, CallCounter) {
    let calls = CallCounter::default();
    let factory = SimpleHandlerFactory::new();
    let counter = calls.clone();
    factory.register(move || CountingHandler(counter.clone()));
    (pipeline_with(registration, factory, inbox), calls)
}

/// Pipeline around a [`FlakyHandler`] that fails `failures` times, with its counter.
pub fn flaky_pipeline(
    registration: HandlerRegistration<Ping>,
    failures: u32,
) -> (Pipeline<Ping>, CallCounter) {
    let calls = CallCounter::default();
    let factory = SimpleHandlerFactory::new();
    let counter = calls.clone();
    factory.register(move || FlakyHandler {
        calls: counter.clone(),
        failures,
    });
    (pipeline_with(registration, factory, None), calls)
}
