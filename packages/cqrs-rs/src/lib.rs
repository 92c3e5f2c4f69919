//! # CQRS
//!
//! An in-process command/query/event runtime with sagas, command
//! interception, and a side channel for failures nobody is waiting on.
//!
//! ## Core Concepts
//!
//! - [`Command`] = Intent to change state, handled by exactly one handler
//! - [`Query`] = Request for data, handled by exactly one handler
//! - [`Event`] = Fact, fanned out to any number of handlers
//! - [`Saga`] = Long-running reaction that turns events into commands
//! - [`CommandInterceptor`] = Middleware around every command execution
//!
//! ## Architecture
//!
//! ```text
//! caller ── execute_command ──► CommandBus ──► interceptors ──► handler
//!    │                              ▲                              │
//!    │                              │ execute_envelope             │ publish
//!    │                              │                              ▼
//!    └──── publish_event ─────────► EventBus ──► event handlers (fan-out)
//!                                   │    │
//!                         stream()  │    └─► failures ─┐
//!                                   ▼                  ▼
//!                              SagaEngine ──────► UnhandledExceptionBus ──► observers
//! ```
//!
//! ## Failure Handling
//!
//! - Command and query failures return to the caller as [`CqrsError`]
//! - Event handler failures and saga failures have no caller; they are
//!   published on the [`UnhandledExceptionBus`] and never disturb other
//!   handlers or sagas
//! - No retries anywhere; put retry policy in a handler or an interceptor
//!
//! ## Guarantees
//!
//! - **In-memory only**: nothing is persisted or replayed
//! - **Lossless saga streams**: each saga has its own unbounded queue
//! - **Isolated instances**: every [`CqrsModule`] owns its own buses
//!
//! ## Example
//!
//! ```ignore
//! use cqrs::{commands, handler_fn, saga_fn, CqrsConfig, CqrsModule, EventStream, Registrations};
//!
//! let registrations = Registrations::new()
//!     .with_command::<CreateUser, _>(CreateUserHandler::new(users))
//!     .with_command::<SendWelcomeEmail, _>(mailer)
//!     .with_saga(saga_fn("welcome", |events: EventStream| {
//!         commands(events.of_type::<UserCreated>().map(|e| SendWelcomeEmail { user_id: e.user_id }))
//!     }));
//!
//! let module = CqrsModule::new(CqrsConfig::from_env()?);
//! module.bootstrap(&registrations)?;
//!
//! let user_id = module.execute_command(CreateUser { name: "Ada".into() }).await?;
//! ```

// Core modules
mod aggregate;
mod bus;
mod command_bus;
mod config;
mod core;
mod error;
mod handler;
mod intercept;
mod module;
mod query_bus;
mod saga;
mod stream;
mod subscription;
mod unhandled;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{
    Command, CommandEnvelope, CommandOutput, Event, EventEnvelope, MessageKey, MessageKind,
    MessageRef, Query,
};

// Re-export error types
pub use crate::error::CqrsError;

// Re-export handler types
pub use handler::{
    handler_fn, CommandHandler, CommandHandlerBinding, EventHandler, EventHandlerBinding,
    HandlerFn, QueryHandler, QueryHandlerBinding,
};

// Re-export bus types
pub use bus::EventBus;
pub use command_bus::CommandBus;
pub use query_bus::QueryBus;
pub use stream::EventStream;

// Re-export interception types
pub use intercept::{CommandInterceptor, InterceptionPipeline, Next};

// Re-export saga types
pub use saga::{commands, saga_fn, try_commands, Saga, SagaEngine, SagaFn, SagaOutput};

// Re-export unhandled exception types
pub use unhandled::{
    ExceptionSource, UnhandledExceptionBus, UnhandledExceptionInfo, UnhandledExceptionObserver,
    UnhandledExceptionReport,
};

// Re-export composition root
pub use module::{CqrsModule, Explorer, Registrations};

// Re-export configuration
pub use config::{CqrsConfig, EventHandlerMode};

// Re-export aggregate types
pub use aggregate::{AggregateRoot, EventPublisher};

pub use subscription::Subscription;

// Re-export commonly used external types
pub use async_trait::async_trait;
