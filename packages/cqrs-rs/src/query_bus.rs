//! Query bus: routes each query to exactly one handler.
//!
//! Same routing rules as the command bus, without interception. Queries keep
//! their concrete types end to end.

use std::any::type_name;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::core::{MessageKey, MessageKind, Query};
use crate::error::{panic_message, CqrsError};
use crate::handler::{QueryHandler, QueryHandlerBinding};

/// Routes queries to their single registered handler.
#[derive(Clone)]
pub struct QueryBus {
    handlers: Arc<DashMap<MessageKey, QueryHandlerBinding>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Register query handlers.
    ///
    /// Same duplicate rules as [`CommandBus::register`](crate::CommandBus::register).
    pub fn register<I>(&self, bindings: I) -> Result<(), CqrsError>
    where
        I: IntoIterator<Item = QueryHandlerBinding>,
    {
        for binding in bindings {
            match self.handlers.entry(binding.key) {
                Entry::Occupied(existing) => {
                    warn!(
                        query = binding.key.type_name(),
                        existing = existing.get().name,
                        rejected = binding.name,
                        "query handler already registered"
                    );
                    return Err(CqrsError::DuplicateHandler {
                        kind: MessageKind::Query,
                        type_name: binding.key.type_name(),
                    });
                }
                Entry::Vacant(slot) => {
                    info!(
                        query = binding.key.type_name(),
                        handler = binding.name,
                        "query handler registered"
                    );
                    slot.insert(binding);
                }
            }
        }
        Ok(())
    }

    pub fn register_handler<Q, H>(&self, handler: H) -> Result<(), CqrsError>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.register([QueryHandlerBinding::new::<Q, H>(handler)])
    }

    /// Execute a query and return its handler's output.
    pub async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Output, CqrsError> {
        let not_found = || CqrsError::HandlerNotFound {
            kind: MessageKind::Query,
            type_name: type_name::<Q>(),
        };

        let (name, handler) = {
            let binding = self.handlers.get(&MessageKey::of::<Q>()).ok_or_else(not_found)?;
            let handler = binding
                .handler
                .downcast_ref::<Arc<dyn QueryHandler<Q>>>()
                .cloned()
                .ok_or_else(not_found)?;
            (binding.name, handler)
        };

        debug!(query = type_name::<Q>(), handler = name, "executing query");

        match AssertUnwindSafe(handler.execute(query)).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(CqrsError::from_handler(MessageKind::Query, type_name::<Q>(), err)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(query = type_name::<Q>(), handler = name, panic = %message, "query handler panicked");
                Err(CqrsError::HandlerExecution {
                    kind: MessageKind::Query,
                    type_name: type_name::<Q>(),
                    source: anyhow!("handler panicked: {message}"),
                })
            }
        }
    }

    pub fn has_handler<Q: Query>(&self) -> bool {
        self.handlers.contains_key(&MessageKey::of::<Q>())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
