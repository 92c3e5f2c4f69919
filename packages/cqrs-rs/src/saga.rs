//! Sagas: long-running reactions that turn events into commands.
//!
//! A saga receives the whole event stream once, at registration, and returns
//! a stream of commands. The engine consumes that stream in its own task and
//! executes every command through the [`CommandBus`], interceptors included.
//!
//! ```ignore
//! let welcome = saga_fn("welcome", |events: EventStream| {
//!     commands(
//!         events
//!             .of_type::<UserCreated>()
//!             .map(|e| SendWelcomeEmail { user_id: e.user_id }),
//!     )
//! });
//!
//! let subscription = engine.register(welcome)?;
//! ```
//!
//! # Failure semantics
//!
//! - A command that fails (including `HandlerNotFound` and panics) is reported
//!   on the unhandled exception channel; the saga keeps running.
//! - An `Err` item ends that saga only, after being reported.
//! - Stream completion ends that saga only.
//!
//! Neither ever affects the event bus or other sagas.

use std::any::type_name;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::command_bus::CommandBus;
use crate::core::{Command, CommandEnvelope};
use crate::error::{panic_message, CqrsError};
use crate::stream::EventStream;
use crate::subscription::{next_subscription_id, Subscription};
use crate::unhandled::{ExceptionSource, UnhandledExceptionBus, UnhandledExceptionInfo};

/// What a saga produces: commands to execute, or an error that ends it.
pub type SagaOutput = BoxStream<'static, Result<CommandEnvelope>>;

/// A reaction from events to commands.
pub trait Saga: Send + Sync + 'static {
    /// Name used in logs and unhandled exception records.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Build the command stream. Called once, at registration.
    fn run(&self, events: EventStream) -> SagaOutput;
}

/// Saga built from a closure. Created with [`saga_fn`].
pub struct SagaFn<F> {
    name: String,
    f: F,
}

/// Build a saga from a name and a closure.
pub fn saga_fn<F>(name: impl Into<String>, f: F) -> SagaFn<F>
where
    F: Fn(EventStream) -> SagaOutput + Send + Sync + 'static,
{
    SagaFn {
        name: name.into(),
        f,
    }
}

impl<F> Saga for SagaFn<F>
where
    F: Fn(EventStream) -> SagaOutput + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, events: EventStream) -> SagaOutput {
        (self.f)(events)
    }
}

/// Wrap a stream of typed commands as saga output.
pub fn commands<S, C>(stream: S) -> SagaOutput
where
    S: Stream<Item = C> + Send + 'static,
    C: Command,
{
    stream.map(|command| Ok(CommandEnvelope::new(command))).boxed()
}

/// Wrap a fallible stream of typed commands as saga output.
///
/// The first `Err` ends the saga.
pub fn try_commands<S, C>(stream: S) -> SagaOutput
where
    S: Stream<Item = Result<C>> + Send + 'static,
    C: Command,
{
    stream.map(|item| item.map(CommandEnvelope::new)).boxed()
}

// =============================================================================
// Engine
// =============================================================================

/// Runs sagas against an event bus, feeding their commands to a command bus.
#[derive(Clone)]
pub struct SagaEngine {
    events: EventBus,
    commands: CommandBus,
    exceptions: UnhandledExceptionBus,
    running: Arc<DashMap<u64, Subscription>>,
}

impl SagaEngine {
    pub fn new(events: EventBus, commands: CommandBus, exceptions: UnhandledExceptionBus) -> Self {
        Self {
            events,
            commands,
            exceptions,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Start every saga, one subscription each.
    ///
    /// Each saga is subscribed to the event stream before this returns, so it
    /// sees every event published afterwards. Sagas run as Tokio tasks: called
    /// outside a runtime this fails with [`CqrsError::RuntimeUnavailable`] and
    /// starts nothing.
    pub fn register_sagas<I>(&self, sagas: I) -> Result<Vec<Subscription>, CqrsError>
    where
        I: IntoIterator<Item = Arc<dyn Saga>>,
    {
        let sagas: Vec<_> = sagas.into_iter().collect();
        let runtime = match sagas.first() {
            Some(first) => runtime_for(first.as_ref())?,
            None => return Ok(Vec::new()),
        };
        Ok(sagas
            .into_iter()
            .map(|saga| self.start(&runtime, saga))
            .collect())
    }

    /// Start a single saga. Needs a Tokio runtime, like [`register_sagas`](Self::register_sagas).
    pub fn register<S: Saga>(&self, saga: S) -> Result<Subscription, CqrsError> {
        let runtime = runtime_for(&saga)?;
        Ok(self.start(&runtime, Arc::new(saga)))
    }

    /// Number of sagas still consuming their streams.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Cancel every running saga.
    pub fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = self
            .running
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }

    fn start(&self, runtime: &Handle, saga: Arc<dyn Saga>) -> Subscription {
        let name = saga.name().to_string();
        let output = saga.run(self.events.stream());

        let id = next_subscription_id();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let subscription = Subscription::new(id, move || {
            let _ = cancel_tx.send(true);
        });
        self.running.insert(id, subscription.clone());

        info!(saga = %name, subscription = id, "saga started");

        let runner = SagaRunner {
            name,
            commands: self.commands.clone(),
            exceptions: self.exceptions.clone(),
            _exit: RunnerExit {
                id,
                running: self.running.clone(),
                subscription: subscription.clone(),
            },
        };
        runtime.spawn(runner.run(output, cancel_rx));

        subscription
    }
}

fn runtime_for(saga: &dyn Saga) -> Result<Handle, CqrsError> {
    Handle::try_current().map_err(|_| CqrsError::RuntimeUnavailable {
        saga: saga.name().to_string(),
    })
}

impl std::fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngine")
            .field("running", &self.running_count())
            .finish()
    }
}

/// Deregisters a saga however its task ends, panics included.
struct RunnerExit {
    id: u64,
    running: Arc<DashMap<u64, Subscription>>,
    subscription: Subscription,
}

impl Drop for RunnerExit {
    fn drop(&mut self) {
        self.running.remove(&self.id);
        self.subscription.mark_closed();
    }
}

struct SagaRunner {
    name: String,
    commands: CommandBus,
    exceptions: UnhandledExceptionBus,
    _exit: RunnerExit,
}

impl SagaRunner {
    async fn run(self, mut output: SagaOutput, mut cancel: watch::Receiver<bool>) {
        loop {
            // AssertUnwindSafe: the stream is dropped right after a panic
            let polled = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    info!(saga = %self.name, "saga cancelled");
                    break;
                }
                polled = AssertUnwindSafe(output.next()).catch_unwind() => polled,
            };

            let failure = match polled {
                Ok(Some(Ok(command))) => {
                    self.dispatch(command);
                    continue;
                }
                Ok(Some(Err(err))) => err,
                Ok(None) => {
                    info!(saga = %self.name, "saga completed");
                    break;
                }
                Err(panic) => anyhow!("saga stream panicked: {}", panic_message(panic.as_ref())),
            };

            warn!(saga = %self.name, error = %failure, "saga stream failed");
            self.exceptions.publish(UnhandledExceptionInfo::new(
                ExceptionSource::Saga {
                    saga: self.name.clone(),
                },
                None,
                CqrsError::SagaStream {
                    saga: self.name.clone(),
                    source: failure,
                },
            ));
            break;
        }
    }

    /// Execute one saga command in its own task.
    fn dispatch(&self, command: CommandEnvelope) {
        debug!(saga = %self.name, command = command.type_name(), "saga emitted command");

        let commands = self.commands.clone();
        let exceptions = self.exceptions.clone();
        let saga = self.name.clone();
        tokio::spawn(async move {
            let cause = command.message_ref();
            if let Err(err) = commands.execute_envelope(command).await {
                exceptions.publish(UnhandledExceptionInfo::new(
                    ExceptionSource::Saga { saga },
                    Some(cause),
                    err,
                ));
            }
        });
    }
}

/// Resolves once cancellation was requested. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let requested = *rx.borrow_and_update();
        if requested {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventHandlerMode;
    use crate::handler::handler_fn;
    use anyhow::anyhow;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, Clone)]
    struct OrderPlaced {
        order_id: u64,
    }

    #[derive(Debug, Clone)]
    struct ShipOrder {
        order_id: u64,
    }

    impl Command for ShipOrder {
        type Output = ();
    }

    struct Harness {
        events: EventBus,
        commands: CommandBus,
        exceptions: UnhandledExceptionBus,
        engine: SagaEngine,
    }

    fn harness() -> Harness {
        let exceptions = UnhandledExceptionBus::with_logging(false);
        let events = EventBus::new(exceptions.clone(), EventHandlerMode::Concurrent);
        let commands = CommandBus::new();
        let engine = SagaEngine::new(events.clone(), commands.clone(), exceptions.clone());
        Harness {
            events,
            commands,
            exceptions,
            engine,
        }
    }

    fn shipping_saga() -> impl Saga {
        saga_fn("shipping", |events: EventStream| {
            commands(
                events
                    .of_type::<OrderPlaced>()
                    .map(|e| ShipOrder { order_id: e.order_id }),
            )
        })
    }

    fn record_shipments(h: &Harness) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        h.commands
            .register_handler::<ShipOrder, _>(handler_fn(move |cmd: ShipOrder| {
                let tx = tx.clone();
                async move {
                    if cmd.order_id == 0 {
                        anyhow::bail!("order 0 cannot ship");
                    }
                    let _ = tx.send(cmd.order_id);
                    Ok(())
                }
            }))
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_saga_turns_events_into_commands() {
        let h = harness();
        let mut shipped = record_shipments(&h);
        let sub = h.engine.register(shipping_saga()).unwrap();

        h.events.publish(OrderPlaced { order_id: 7 }).await;

        let order = timeout(Duration::from_secs(1), shipped.recv()).await.unwrap();
        assert_eq!(order, Some(7));
        assert!(!sub.is_closed());
        assert_eq!(h.engine.running_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_command_is_reported_and_saga_continues() {
        let h = harness();
        let mut shipped = record_shipments(&h);
        let (mut failures, _obs) = h.exceptions.subscribe_channel();
        h.engine.register(shipping_saga()).unwrap();

        h.events.publish(OrderPlaced { order_id: 0 }).await;
        let info = timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            info.source,
            ExceptionSource::Saga {
                saga: "shipping".into()
            }
        );
        assert!(info.error.is_handler_execution());
        assert_eq!(
            info.cause.as_ref().unwrap().downcast_ref::<ShipOrder>().unwrap().order_id,
            0
        );

        h.events.publish(OrderPlaced { order_id: 8 }).await;
        let order = timeout(Duration::from_secs(1), shipped.recv()).await.unwrap();
        assert_eq!(order, Some(8));
    }

    #[tokio::test]
    async fn test_missing_handler_is_reported() {
        let h = harness();
        let (mut failures, _obs) = h.exceptions.subscribe_channel();
        h.engine.register(shipping_saga()).unwrap();

        h.events.publish(OrderPlaced { order_id: 1 }).await;
        let info = timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(info.error.is_handler_not_found());
    }

    #[tokio::test]
    async fn test_stream_error_ends_only_that_saga() {
        let h = harness();
        let mut shipped = record_shipments(&h);
        let (mut failures, _obs) = h.exceptions.subscribe_channel();

        let broken = h
            .engine
            .register(saga_fn("broken", |events: EventStream| {
                try_commands(events.of_type::<OrderPlaced>().map(|_| {
                    Err::<ShipOrder, _>(anyhow!("lost upstream"))
                }))
            }))
            .unwrap();
        let healthy = h.engine.register(shipping_saga()).unwrap();

        h.events.publish(OrderPlaced { order_id: 3 }).await;

        let info = timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(info.error.is_saga_stream());
        assert!(info.cause.is_none());

        let order = timeout(Duration::from_secs(1), shipped.recv()).await.unwrap();
        assert_eq!(order, Some(3));

        timeout(Duration::from_secs(1), async {
            while !broken.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!healthy.is_closed());
    }

    #[tokio::test]
    async fn test_completed_saga_closes_its_subscription() {
        let h = harness();
        let sub = h
            .engine
            .register(saga_fn("once", |_events: EventStream| {
                futures::stream::empty::<Result<CommandEnvelope>>().boxed()
            }))
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while !sub.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.engine.running_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_saga() {
        let h = harness();
        let mut shipped = record_shipments(&h);
        let sub = h.engine.register(shipping_saga()).unwrap();

        h.events.publish(OrderPlaced { order_id: 1 }).await;
        assert_eq!(
            timeout(Duration::from_secs(1), shipped.recv()).await.unwrap(),
            Some(1)
        );

        sub.unsubscribe();
        timeout(Duration::from_secs(1), async {
            while h.engine.running_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        h.events.publish(OrderPlaced { order_id: 2 }).await;
        assert!(timeout(Duration::from_millis(100), shipped.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_sagas() {
        let h = harness();
        h.engine.register(shipping_saga()).unwrap();
        h.engine.register(shipping_saga()).unwrap();
        assert_eq!(h.engine.running_count(), 2);

        h.engine.shutdown();
        timeout(Duration::from_secs(1), async {
            while h.engine.running_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_saga_stream_is_reported_and_deregistered() {
        let h = harness();
        let mut shipped = record_shipments(&h);
        let (mut failures, _obs) = h.exceptions.subscribe_channel();

        let faulty = h
            .engine
            .register(saga_fn("faulty", |events: EventStream| {
                commands(events.of_type::<OrderPlaced>().map(|e| -> ShipOrder {
                    panic!("no route for order {}", e.order_id)
                }))
            }))
            .unwrap();
        let healthy = h.engine.register(shipping_saga()).unwrap();

        h.events.publish(OrderPlaced { order_id: 4 }).await;

        let info = timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            info.source,
            ExceptionSource::Saga {
                saga: "faulty".into()
            }
        );
        assert!(info.error.is_saga_stream());
        assert!(info.error.to_string().contains("no route for order 4"));
        assert!(info.cause.is_none());

        timeout(Duration::from_secs(1), async {
            while !faulty.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.engine.running_count(), 1);
        assert!(!healthy.is_closed());

        let order = timeout(Duration::from_secs(1), shipped.recv()).await.unwrap();
        assert_eq!(order, Some(4));
    }

    #[test]
    fn test_register_without_runtime_fails() {
        let h = harness();

        let err = h.engine.register(shipping_saga()).unwrap_err();
        assert!(err.is_runtime_unavailable());
        assert!(err.to_string().contains("shipping"));

        let err = h
            .engine
            .register_sagas([Arc::new(shipping_saga()) as Arc<dyn Saga>])
            .unwrap_err();
        assert!(err.is_runtime_unavailable());
        assert_eq!(h.engine.running_count(), 0);
        assert_eq!(h.events.stream_subscriber_count(), 0);
    }
}
