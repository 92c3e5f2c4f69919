//! Handler traits, type-erased wrappers, and registration bindings.
//!
//! Handlers are the application layer of the runtime. They:
//! 1. Receive a message (command, query, or event)
//! 2. Do the work (IO, state changes)
//! 3. Return a result (commands/queries) or nothing (events)
//!
//! Handlers return `anyhow::Result`; the buses convert failures into
//! [`CqrsError`](crate::CqrsError) at their boundary.
//!
//! # Bindings
//!
//! A binding pairs a [`MessageKey`] with a type-erased handler. Bindings are
//! plain data: whatever discovers handlers (an [`Explorer`](crate::Explorer),
//! or manual wiring) builds a list of bindings and hands it to a bus.
//!
//! ```ignore
//! let bindings = vec![
//!     CommandHandlerBinding::new::<CreateUser, _>(CreateUserHandler::new(db)),
//!     CommandHandlerBinding::new::<DeleteUser, _>(handler_fn(|cmd: DeleteUser| async move {
//!         Ok(())
//!     })),
//! ];
//! command_bus.register(bindings)?;
//! ```

use std::any::{type_name, Any};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{Command, CommandEnvelope, CommandOutput, Event, EventEnvelope, MessageKey, Query};
use crate::error::CqrsError;

/// Handler for a single command type.
///
/// # Example
///
/// ```ignore
/// struct CreateUserHandler {
///     users: UserRepository,
/// }
///
/// #[async_trait]
/// impl CommandHandler<CreateUser> for CreateUserHandler {
///     async fn execute(&self, command: CreateUser) -> Result<u64> {
///         self.users.insert(&command.name).await
///     }
/// }
/// ```
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn execute(&self, command: C) -> Result<C::Output>;
}

/// Handler for a single query type.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    async fn execute(&self, query: Q) -> Result<Q::Output>;
}

/// Handler for a single event type.
///
/// Any number of event handlers may be registered per event type. Errors are
/// not returned to the publisher; they are reported on the unhandled
/// exception channel.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> Result<()>;
}

/// Adapter that turns an async closure into a handler.
///
/// Created with [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Build a handler from an async closure.
///
/// The same adapter works for commands, queries, and events; the binding
/// decides which trait is used.
///
/// ```ignore
/// let binding = CommandHandlerBinding::new::<CreateUser, _>(handler_fn(|cmd: CreateUser| async move {
///     Ok(cmd.name.len() as u64)
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<C, F, Fut> CommandHandler<C> for HandlerFn<F>
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Output>> + Send + 'static,
{
    async fn execute(&self, command: C) -> Result<C::Output> {
        (self.f)(command).await
    }
}

#[async_trait]
impl<Q, F, Fut> QueryHandler<Q> for HandlerFn<F>
where
    Q: Query,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Q::Output>> + Send + 'static,
{
    async fn execute(&self, query: Q) -> Result<Q::Output> {
        (self.f)(query).await
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for HandlerFn<F>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: E) -> Result<()> {
        (self.f)(event).await
    }
}

// =============================================================================
// Type-erased handlers
// =============================================================================

/// Type-erased command handler for internal use.
#[async_trait]
pub(crate) trait AnyCommandHandler: Send + Sync {
    async fn execute_any(&self, command: CommandEnvelope) -> Result<CommandOutput>;
}

struct CommandHandlerWrapper<H, C> {
    handler: H,
    _phantom: PhantomData<fn() -> C>,
}

#[async_trait]
impl<H, C> AnyCommandHandler for CommandHandlerWrapper<H, C>
where
    H: CommandHandler<C>,
    C: Command,
{
    async fn execute_any(&self, command: CommandEnvelope) -> Result<CommandOutput> {
        let command = command.into_command::<C>()?;
        let output = self.handler.execute(command).await?;
        Ok(CommandOutput::new(output))
    }
}

/// Type-erased event handler for internal use.
#[async_trait]
pub(crate) trait AnyEventHandler: Send + Sync {
    async fn handle_any(&self, event: &EventEnvelope) -> Result<()>;
}

struct EventHandlerWrapper<H, E> {
    handler: H,
    _phantom: PhantomData<fn() -> E>,
}

#[async_trait]
impl<H, E> AnyEventHandler for EventHandlerWrapper<H, E>
where
    H: EventHandler<E>,
    E: Event,
{
    async fn handle_any(&self, event: &EventEnvelope) -> Result<()> {
        let Some(event) = event.downcast_ref::<E>() else {
            return Err(CqrsError::EventTypeMismatch {
                expected: type_name::<E>(),
                actual: event.type_name(),
            }
            .into());
        };
        self.handler.handle(event.clone()).await
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// A command handler paired with the command type it handles.
#[derive(Clone)]
pub struct CommandHandlerBinding {
    pub(crate) key: MessageKey,
    pub(crate) name: &'static str,
    pub(crate) handler: Arc<dyn AnyCommandHandler>,
}

impl CommandHandlerBinding {
    pub fn new<C, H>(handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        Self {
            key: MessageKey::of::<C>(),
            name: type_name::<H>(),
            handler: Arc::new(CommandHandlerWrapper {
                handler,
                _phantom: PhantomData,
            }),
        }
    }

    /// Override the handler name used in logs and error records.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn handler_name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for CommandHandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandlerBinding")
            .field("command", &self.key)
            .field("handler", &self.name)
            .finish()
    }
}

/// A query handler paired with the query type it handles.
///
/// Queries are never intercepted, so the handler keeps its concrete output
/// type: the payload is an `Arc<dyn QueryHandler<Q>>` behind `dyn Any`.
#[derive(Clone)]
pub struct QueryHandlerBinding {
    pub(crate) key: MessageKey,
    pub(crate) name: &'static str,
    pub(crate) handler: Arc<dyn Any + Send + Sync>,
}

impl QueryHandlerBinding {
    pub fn new<Q, H>(handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        let typed: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        Self {
            key: MessageKey::of::<Q>(),
            name: type_name::<H>(),
            handler: Arc::new(typed),
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn handler_name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for QueryHandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandlerBinding")
            .field("query", &self.key)
            .field("handler", &self.name)
            .finish()
    }
}

/// An event handler paired with the event type it handles.
#[derive(Clone)]
pub struct EventHandlerBinding {
    pub(crate) key: MessageKey,
    pub(crate) name: &'static str,
    pub(crate) handler: Arc<dyn AnyEventHandler>,
}

impl EventHandlerBinding {
    pub fn new<E, H>(handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        Self {
            key: MessageKey::of::<E>(),
            name: type_name::<H>(),
            handler: Arc::new(EventHandlerWrapper {
                handler,
                _phantom: PhantomData,
            }),
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn handler_name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for EventHandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlerBinding")
            .field("event", &self.key)
            .field("handler", &self.name)
            .finish()
    }
}
