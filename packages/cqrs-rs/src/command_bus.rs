//! Command bus: routes each command to exactly one handler.
//!
//! Every execution goes through the bus's [`InterceptionPipeline`]. The
//! handler lookup happens first, so a command with no handler fails with
//! [`CqrsError::HandlerNotFound`] before any interceptor runs.
//!
//! # Example
//!
//! ```ignore
//! let bus = CommandBus::new();
//! bus.register_handler::<CreateUser, _>(CreateUserHandler::new(users))?;
//!
//! let user_id = bus.execute(CreateUser { name: "Ada".into() }).await?;
//! ```

use std::any::type_name;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::core::{Command, CommandEnvelope, CommandOutput, MessageKey, MessageKind};
use crate::error::{panic_message, CqrsError};
use crate::handler::{CommandHandler, CommandHandlerBinding};
use crate::intercept::{CommandInterceptor, InterceptionPipeline};

struct CommandBusInner {
    handlers: DashMap<MessageKey, CommandHandlerBinding>,
    interceptors: InterceptionPipeline,
}

/// Routes commands to their single registered handler.
///
/// Cheap to clone; clones share the same handler table and interceptors.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<CommandBusInner>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CommandBusInner {
                handlers: DashMap::new(),
                interceptors: InterceptionPipeline::new(),
            }),
        }
    }

    /// Register command handlers.
    ///
    /// Stops at the first command type that already has a handler and returns
    /// [`CqrsError::DuplicateHandler`]. The existing handler stays active, and
    /// bindings earlier in the list stay registered.
    pub fn register<I>(&self, bindings: I) -> Result<(), CqrsError>
    where
        I: IntoIterator<Item = CommandHandlerBinding>,
    {
        for binding in bindings {
            match self.inner.handlers.entry(binding.key) {
                Entry::Occupied(existing) => {
                    warn!(
                        command = binding.key.type_name(),
                        existing = existing.get().name,
                        rejected = binding.name,
                        "command handler already registered"
                    );
                    return Err(CqrsError::DuplicateHandler {
                        kind: MessageKind::Command,
                        type_name: binding.key.type_name(),
                    });
                }
                Entry::Vacant(slot) => {
                    info!(
                        command = binding.key.type_name(),
                        handler = binding.name,
                        "command handler registered"
                    );
                    slot.insert(binding);
                }
            }
        }
        Ok(())
    }

    /// Register a single command handler.
    pub fn register_handler<C, H>(&self, handler: H) -> Result<(), CqrsError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.register([CommandHandlerBinding::new::<C, H>(handler)])
    }

    /// Append interceptors to this bus's pipeline.
    pub fn register_interceptors<I>(&self, interceptors: I)
    where
        I: IntoIterator<Item = Arc<dyn CommandInterceptor>>,
    {
        self.inner.interceptors.register(interceptors);
    }

    pub fn interceptors(&self) -> &InterceptionPipeline {
        &self.inner.interceptors
    }

    /// Execute a command and return its handler's output.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, CqrsError> {
        let output = self.execute_envelope(CommandEnvelope::new(command)).await?;
        output.into_value::<C::Output>(type_name::<C>())
    }

    /// Execute a type-erased command.
    ///
    /// Handler errors come back as [`CqrsError::HandlerExecution`] carrying
    /// the handler's error unchanged. Panics are caught and reported the same
    /// way.
    pub async fn execute_envelope(&self, command: CommandEnvelope) -> Result<CommandOutput, CqrsError> {
        let key = command.key();
        let binding = self
            .inner
            .handlers
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(CqrsError::HandlerNotFound {
                kind: MessageKind::Command,
                type_name: key.type_name(),
            })?;

        debug!(command = key.type_name(), handler = binding.name, "executing command");

        // AssertUnwindSafe: the handler is shared and outlives the panic
        let result = AssertUnwindSafe(
            self.inner
                .interceptors
                .execute(command, binding.handler.as_ref()),
        )
        .catch_unwind()
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => {
                debug!(command = key.type_name(), error = %err, "command failed");
                Err(CqrsError::from_handler(MessageKind::Command, key.type_name(), err))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    command = key.type_name(),
                    handler = binding.name,
                    panic = %message,
                    "command handler panicked"
                );
                Err(CqrsError::HandlerExecution {
                    kind: MessageKind::Command,
                    type_name: key.type_name(),
                    source: anyhow!("handler panicked: {message}"),
                })
            }
        }
    }

    pub fn has_handler<C: Command>(&self) -> bool {
        self.inner.handlers.contains_key(&MessageKey::of::<C>())
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("handlers", &self.handler_count())
            .field("interceptors", &self.inner.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::intercept::Next;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct CreateUser {
        name: String,
    }

    impl Command for CreateUser {
        type Output = usize;
    }

    #[derive(Debug, Clone)]
    struct Unrouted;

    impl Command for Unrouted {
        type Output = ();
    }

    #[derive(Debug, Clone)]
    struct Explode;

    impl Command for Explode {
        type Output = ();
    }

    #[derive(Debug, thiserror::Error)]
    #[error("name {0} is taken")]
    struct NameTaken(String);

    fn name_length() -> CommandHandlerBinding {
        CommandHandlerBinding::new::<CreateUser, _>(handler_fn(|cmd: CreateUser| async move {
            Ok(cmd.name.len())
        }))
    }

    struct CountingInterceptor(Arc<AtomicUsize>);

    #[async_trait]
    impl CommandInterceptor for CountingInterceptor {
        async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(command).await
        }
    }

    struct WrongOutput;

    #[async_trait]
    impl CommandInterceptor for WrongOutput {
        async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
            next.run(command).await?;
            Ok(CommandOutput::new("not a count"))
        }
    }

    struct Reject;

    #[async_trait]
    impl CommandInterceptor for Reject {
        async fn intercept(&self, _command: CommandEnvelope, _next: Next<'_>) -> Result<CommandOutput> {
            anyhow::bail!("not authorized")
        }
    }

    #[tokio::test]
    async fn test_execute_routes_to_handler() {
        let bus = CommandBus::new();
        bus.register([name_length()]).unwrap();

        assert!(bus.has_handler::<CreateUser>());
        assert_eq!(bus.handler_count(), 1);

        let len = bus.execute(CreateUser { name: "Ada".into() }).await.unwrap();
        assert_eq!(len, 3);
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first_handler() {
        let bus = CommandBus::new();
        bus.register([name_length()]).unwrap();

        let err = bus
            .register_handler::<CreateUser, _>(handler_fn(|_cmd: CreateUser| async { Ok(0usize) }))
            .unwrap_err();
        assert!(err.is_duplicate_handler());

        let len = bus.execute(CreateUser { name: "Grace".into() }).await.unwrap();
        assert_eq!(len, 5);
    }

    #[tokio::test]
    async fn test_bindings_before_duplicate_stay_registered() {
        let bus = CommandBus::new();
        bus.register([name_length()]).unwrap();

        let unrouted = CommandHandlerBinding::new::<Unrouted, _>(handler_fn(|_cmd: Unrouted| async { Ok(()) }));
        let err = bus.register([unrouted, name_length()]).unwrap_err();

        assert!(err.is_duplicate_handler());
        assert!(bus.has_handler::<Unrouted>());
        assert_eq!(bus.handler_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_handler_skips_interceptors() {
        let bus = CommandBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.interceptors()
            .register_interceptor(CountingInterceptor(seen.clone()));

        let err = bus.execute(Unrouted).await.unwrap_err();
        match err {
            CqrsError::HandlerNotFound { kind, type_name } => {
                assert_eq!(kind, MessageKind::Command);
                assert!(type_name.ends_with("Unrouted"));
            }
            other => panic!("expected HandlerNotFound, got {other:?}"),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped_unchanged() {
        let bus = CommandBus::new();
        bus.register_handler::<CreateUser, _>(handler_fn(|cmd: CreateUser| async move {
            Err::<usize, _>(NameTaken(cmd.name).into())
        }))
        .unwrap();

        let err = bus.execute(CreateUser { name: "Ada".into() }).await.unwrap_err();
        match err {
            CqrsError::HandlerExecution { source, .. } => {
                assert_eq!(source.downcast_ref::<NameTaken>().unwrap().0, "Ada");
            }
            other => panic!("expected HandlerExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nested_missing_handler_is_a_handler_failure() {
        let bus = CommandBus::new();
        let inner = bus.clone();
        bus.register_handler::<CreateUser, _>(handler_fn(move |_cmd: CreateUser| {
            let inner = inner.clone();
            async move {
                inner.execute(Unrouted).await?;
                Ok::<usize, anyhow::Error>(0)
            }
        }))
        .unwrap();

        let err = bus.execute(CreateUser { name: "Ada".into() }).await.unwrap_err();
        match err {
            CqrsError::HandlerExecution { kind, type_name, source } => {
                assert_eq!(kind, MessageKind::Command);
                assert!(type_name.ends_with("CreateUser"));
                let nested = source.downcast_ref::<CqrsError>().unwrap();
                assert!(nested.is_handler_not_found());
                assert!(nested.to_string().contains("Unrouted"));
            }
            other => panic!("expected HandlerExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interceptor_rejection_reaches_caller() {
        let bus = CommandBus::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        bus.register_handler::<CreateUser, _>(handler_fn(move |cmd: CreateUser| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(cmd.name.len())
            }
        }))
        .unwrap();
        bus.interceptors().register_interceptor(Reject);

        let err = bus.execute(CreateUser { name: "Ada".into() }).await.unwrap_err();
        match &err {
            CqrsError::HandlerExecution { kind, source, .. } => {
                assert_eq!(*kind, MessageKind::Command);
                assert_eq!(source.to_string(), "not authorized");
            }
            other => panic!("expected HandlerExecution, got {other:?}"),
        }
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error() {
        let bus = CommandBus::new();
        bus.register_handler::<Explode, _>(handler_fn(|_cmd: Explode| async {
            if true {
                panic!("boom");
            }
            Ok(())
        }))
        .unwrap();

        let err = bus.execute(Explode).await.unwrap_err();
        assert!(err.is_handler_execution());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_interceptor_runs_once_per_execute() {
        let bus = CommandBus::new();
        bus.register([name_length()]).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.register_interceptors([
            Arc::new(CountingInterceptor(seen.clone())) as Arc<dyn CommandInterceptor>
        ]);

        bus.execute(CreateUser { name: "a".into() }).await.unwrap();
        bus.execute(CreateUser { name: "b".into() }).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_replaced_output_with_wrong_type() {
        let bus = CommandBus::new();
        bus.register([name_length()]).unwrap();
        bus.interceptors().register_interceptor(WrongOutput);

        let err = bus.execute(CreateUser { name: "Ada".into() }).await.unwrap_err();
        assert!(matches!(err, CqrsError::OutputTypeMismatch { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_executions_are_independent() {
        let bus = CommandBus::new();
        bus.register_handler::<CreateUser, _>(handler_fn(|cmd: CreateUser| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(cmd.name.len())
        }))
        .unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.execute(CreateUser { name: "x".repeat(i) }).await })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), i);
        }
    }
}
