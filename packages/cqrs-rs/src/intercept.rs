//! Command interception pipeline.
//!
//! Interceptors wrap every command execution, middleware-style. With
//! interceptors `[A, B]` registered in that order, a command runs as
//! `A(B(handler))`: `A` sees the command first and the result last.
//!
//! ```ignore
//! struct Timing;
//!
//! #[async_trait]
//! impl CommandInterceptor for Timing {
//!     async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
//!         let start = Instant::now();
//!         let output = next.run(command).await;
//!         debug!(elapsed_ms = start.elapsed().as_millis() as u64, "command finished");
//!         output
//!     }
//! }
//! ```
//!
//! An interceptor may call `next` zero times (short-circuit), once, or several
//! times (retry). Queries are never intercepted.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::core::{CommandEnvelope, CommandOutput};
use crate::handler::AnyCommandHandler;

/// Middleware around command execution.
#[async_trait]
pub trait CommandInterceptor: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handle `command`, usually by delegating to `next`.
    ///
    /// Returning an error without calling `next` stops the chain; the caller
    /// sees it as a handler failure.
    async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput>;
}

/// The rest of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn CommandInterceptor>],
    handler: &'a dyn AnyCommandHandler,
}

impl<'a> Next<'a> {
    /// Run the remaining interceptors and then the handler.
    pub fn run(self, command: CommandEnvelope) -> BoxFuture<'a, Result<CommandOutput>> {
        match self.chain.split_first() {
            Some((interceptor, rest)) => {
                let next = Next {
                    chain: rest,
                    handler: self.handler,
                };
                Box::pin(async move { interceptor.intercept(command, next).await })
            }
            None => {
                let handler = self.handler;
                Box::pin(async move { handler.execute_any(command).await })
            }
        }
    }

    /// Number of interceptors still ahead of the handler.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}

/// Ordered interceptor chain.
///
/// The chain is an immutable snapshot rebuilt on registration; dispatch only
/// clones the `Arc`.
pub struct InterceptionPipeline {
    chain: RwLock<Arc<[Arc<dyn CommandInterceptor>]>>,
}

impl InterceptionPipeline {
    pub fn new() -> Self {
        Self {
            chain: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Append interceptors, keeping their order.
    pub fn register<I>(&self, interceptors: I)
    where
        I: IntoIterator<Item = Arc<dyn CommandInterceptor>>,
    {
        let added: Vec<_> = interceptors.into_iter().collect();
        if added.is_empty() {
            return;
        }

        let mut chain = match self.chain.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut rebuilt: Vec<_> = chain.iter().cloned().collect();
        for interceptor in added {
            debug!(interceptor = interceptor.name(), position = rebuilt.len(), "interceptor registered");
            rebuilt.push(interceptor);
        }
        *chain = Arc::from(rebuilt);
    }

    /// Append a single interceptor.
    pub fn register_interceptor<I: CommandInterceptor>(&self, interceptor: I) {
        self.register([Arc::new(interceptor) as Arc<dyn CommandInterceptor>]);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interceptor names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(|i| i.name()).collect()
    }

    /// Run `command` through every interceptor and then `handler`.
    pub(crate) async fn execute(
        &self,
        command: CommandEnvelope,
        handler: &dyn AnyCommandHandler,
    ) -> Result<CommandOutput> {
        let chain = self.snapshot();
        Next {
            chain: &chain,
            handler,
        }
        .run(command)
        .await
    }

    fn snapshot(&self) -> Arc<[Arc<dyn CommandInterceptor>]> {
        match self.chain.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for InterceptionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterceptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionPipeline")
            .field("interceptors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Command;
    use crate::handler::{handler_fn, CommandHandlerBinding};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Add(u64);

    impl Command for Add {
        type Output = u64;
    }

    fn add_handler(calls: Arc<AtomicUsize>) -> CommandHandlerBinding {
        CommandHandlerBinding::new::<Add, _>(handler_fn(move |cmd: Add| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(cmd.0 + 1)
            }
        }))
    }

    struct Record {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CommandInterceptor for Record {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let output = next.run(command).await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            output
        }
    }

    struct Deny;

    #[async_trait]
    impl CommandInterceptor for Deny {
        async fn intercept(&self, _command: CommandEnvelope, _next: Next<'_>) -> Result<CommandOutput> {
            anyhow::bail!("denied")
        }
    }

    struct Twice;

    #[async_trait]
    impl CommandInterceptor for Twice {
        async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
            next.run(command.clone()).await?;
            next.run(command).await
        }
    }

    struct Rewrite;

    #[async_trait]
    impl CommandInterceptor for Rewrite {
        async fn intercept(&self, command: CommandEnvelope, next: Next<'_>) -> Result<CommandOutput> {
            let bumped = command.downcast_ref::<Add>().map(|add| Add(add.0 * 10));
            let command = bumped.map(CommandEnvelope::new).unwrap_or(command);
            next.run(command).await
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_calls_handler_directly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let binding = add_handler(calls.clone());
        let pipeline = InterceptionPipeline::new();
        assert!(pipeline.is_empty());

        let output = pipeline
            .execute(CommandEnvelope::new(Add(1)), binding.handler.as_ref())
            .await
            .unwrap();
        assert_eq!(output.downcast_ref::<u64>(), Some(&2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interceptors_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let binding = add_handler(calls.clone());

        let pipeline = InterceptionPipeline::new();
        pipeline.register_interceptor(Record { label: "a", log: log.clone() });
        pipeline.register_interceptor(Record { label: "b", log: log.clone() });
        assert_eq!(pipeline.names(), vec!["a", "b"]);

        pipeline
            .execute(CommandEnvelope::new(Add(1)), binding.handler.as_ref())
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "b:after", "a:after"]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let binding = add_handler(calls.clone());

        let pipeline = InterceptionPipeline::new();
        pipeline.register_interceptor(Deny);

        let err = pipeline
            .execute(CommandEnvelope::new(Add(1)), binding.handler.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "denied");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_next_can_run_more_than_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let binding = add_handler(calls.clone());

        let pipeline = InterceptionPipeline::new();
        pipeline.register_interceptor(Twice);

        pipeline
            .execute(CommandEnvelope::new(Add(1)), binding.handler.as_ref())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_interceptor_can_replace_command() {
        let calls = Arc::new(AtomicUsize::new(0));
        let binding = add_handler(calls);

        let pipeline = InterceptionPipeline::new();
        pipeline.register_interceptor(Rewrite);

        let output = pipeline
            .execute(CommandEnvelope::new(Add(2)), binding.handler.as_ref())
            .await
            .unwrap();
        assert_eq!(output.downcast::<u64>().unwrap(), 21);
    }
}
