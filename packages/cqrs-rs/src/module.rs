//! Composition root: builds the buses and wires registrations into them.
//!
//! ```ignore
//! let registrations = Registrations::new()
//!     .with_command::<CreateUser, _>(CreateUserHandler::new(users.clone()))
//!     .with_query::<GetUser, _>(GetUserHandler::new(users))
//!     .with_event::<UserCreated, _>(AuditLogHandler)
//!     .with_saga(welcome_saga())
//!     .with_interceptor(Timing);
//!
//! let module = CqrsModule::new(CqrsConfig::from_env()?);
//! module.bootstrap(&registrations)?;
//!
//! let user_id = module.execute_command(CreateUser { name }).await?;
//! ```

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::info;

use crate::aggregate::EventPublisher;
use crate::bus::EventBus;
use crate::command_bus::CommandBus;
use crate::config::CqrsConfig;
use crate::core::{Command, Event, Query};
use crate::error::CqrsError;
use crate::handler::{
    CommandHandler, CommandHandlerBinding, EventHandler, EventHandlerBinding, QueryHandler,
    QueryHandlerBinding,
};
use crate::intercept::CommandInterceptor;
use crate::query_bus::QueryBus;
use crate::saga::{Saga, SagaEngine};
use crate::subscription::Subscription;
use crate::unhandled::{UnhandledExceptionBus, UnhandledExceptionObserver};

/// Source of handler registrations.
///
/// Implement this to plug in handler discovery; [`Registrations`] implements
/// it for manual wiring.
pub trait Explorer {
    fn explore(&self) -> Registrations;
}

/// Ordered registration lists handed to [`CqrsModule::bootstrap`].
#[derive(Clone, Default)]
pub struct Registrations {
    pub events: Vec<EventHandlerBinding>,
    pub commands: Vec<CommandHandlerBinding>,
    pub queries: Vec<QueryHandlerBinding>,
    pub sagas: Vec<Arc<dyn Saga>>,
    pub interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

impl Registrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.commands.push(CommandHandlerBinding::new::<C, H>(handler));
        self
    }

    pub fn with_query<Q, H>(mut self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.queries.push(QueryHandlerBinding::new::<Q, H>(handler));
        self
    }

    pub fn with_event<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.events.push(EventHandlerBinding::new::<E, H>(handler));
        self
    }

    pub fn with_saga<S: Saga>(mut self, saga: S) -> Self {
        self.sagas.push(Arc::new(saga));
        self
    }

    /// Interceptors wrap in the order they are added.
    pub fn with_interceptor<I: CommandInterceptor>(mut self, interceptor: I) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append another set of registrations, keeping order.
    pub fn merge(mut self, other: Registrations) -> Self {
        self.events.extend(other.events);
        self.commands.extend(other.commands);
        self.queries.extend(other.queries);
        self.sagas.extend(other.sagas);
        self.interceptors.extend(other.interceptors);
        self
    }
}

impl Explorer for Registrations {
    fn explore(&self) -> Registrations {
        self.clone()
    }
}

impl std::fmt::Debug for Registrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrations")
            .field("events", &self.events.len())
            .field("commands", &self.commands.len())
            .field("queries", &self.queries.len())
            .field("sagas", &self.sagas.len())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// One isolated set of buses.
///
/// Every module owns its own buses; nothing is global, so tests and
/// independent subsystems can each build their own.
pub struct CqrsModule {
    config: CqrsConfig,
    commands: CommandBus,
    queries: QueryBus,
    events: EventBus,
    sagas: SagaEngine,
    exceptions: UnhandledExceptionBus,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl CqrsModule {
    pub fn new(config: CqrsConfig) -> Self {
        let exceptions = UnhandledExceptionBus::with_logging(config.log_unhandled_exceptions);
        let events = EventBus::new(exceptions.clone(), config.event_handler_mode);
        let commands = CommandBus::new();
        let sagas = SagaEngine::new(events.clone(), commands.clone(), exceptions.clone());

        Self {
            config,
            commands,
            queries: QueryBus::new(),
            events,
            sagas,
            exceptions,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register everything `explorer` reports.
    ///
    /// Order: event handlers, command handlers, query handlers, interceptors,
    /// then sagas, so a saga's first command already runs through the full
    /// interceptor chain. Fails on the first duplicate command or query
    /// handler.
    ///
    /// Sagas run as Tokio tasks, so registering any needs a runtime. Without
    /// one this returns [`CqrsError::RuntimeUnavailable`] before registering
    /// anything.
    pub fn bootstrap(&self, explorer: &dyn Explorer) -> Result<(), CqrsError> {
        let registrations = explorer.explore();
        if let Some(saga) = registrations.sagas.first() {
            if Handle::try_current().is_err() {
                return Err(CqrsError::RuntimeUnavailable {
                    saga: saga.name().to_string(),
                });
            }
        }

        info!(
            events = registrations.events.len(),
            commands = registrations.commands.len(),
            queries = registrations.queries.len(),
            sagas = registrations.sagas.len(),
            interceptors = registrations.interceptors.len(),
            mode = %self.config.event_handler_mode,
            "bootstrapping cqrs module"
        );

        let mut subscriptions = self.events.register(registrations.events);
        self.keep(&mut subscriptions);

        self.commands.register(registrations.commands)?;
        self.queries.register(registrations.queries)?;
        self.commands.register_interceptors(registrations.interceptors);

        let mut subscriptions = self.sagas.register_sagas(registrations.sagas)?;
        self.keep(&mut subscriptions);

        Ok(())
    }

    fn keep(&self, subscriptions: &mut Vec<Subscription>) {
        let mut kept = match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        kept.append(subscriptions);
    }

    pub async fn execute_command<C: Command>(&self, command: C) -> Result<C::Output, CqrsError> {
        self.commands.execute(command).await
    }

    pub async fn execute_query<Q: Query>(&self, query: Q) -> Result<Q::Output, CqrsError> {
        self.queries.execute(query).await
    }

    pub async fn publish_event<E: Event>(&self, event: E) {
        self.events.publish(event).await;
    }

    pub async fn publish_events<E, I>(&self, events: I)
    where
        E: Event,
        I: IntoIterator<Item = E>,
    {
        self.events.publish_all(events).await;
    }

    pub fn subscribe_unhandled_exceptions<O: UnhandledExceptionObserver>(&self, observer: O) -> Subscription {
        self.exceptions.subscribe(observer)
    }

    /// Cancel every saga and event handler registered through `bootstrap`.
    ///
    /// Command and query handlers stay registered.
    pub fn shutdown(&self) {
        let subscriptions = {
            let mut kept = match self.subscriptions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *kept)
        };
        info!(subscriptions = subscriptions.len(), "shutting down cqrs module");
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        self.sagas.shutdown();
    }

    pub fn config(&self) -> &CqrsConfig {
        &self.config
    }

    pub fn command_bus(&self) -> &CommandBus {
        &self.commands
    }

    pub fn query_bus(&self) -> &QueryBus {
        &self.queries
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn saga_engine(&self) -> &SagaEngine {
        &self.sagas
    }

    pub fn unhandled_exceptions(&self) -> &UnhandledExceptionBus {
        &self.exceptions
    }

    /// Publisher for [`AggregateRoot`](crate::AggregateRoot)s.
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        Arc::new(self.events.clone())
    }
}

impl Default for CqrsModule {
    fn default() -> Self {
        Self::new(CqrsConfig::default())
    }
}

impl std::fmt::Debug for CqrsModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqrsModule")
            .field("config", &self.config)
            .field("commands", &self.commands)
            .field("queries", &self.queries)
            .field("events", &self.events)
            .field("sagas", &self.sagas)
            .finish()
    }
}
