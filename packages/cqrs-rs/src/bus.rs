//! Event bus: fans each event out to every handler registered for its type.
//!
//! # Guarantees
//!
//! - **Stream first**: an event reaches the saga stream before any handler runs
//! - **Failure isolation**: one handler failing (or panicking) never stops the
//!   others; each failure becomes one record on the unhandled exception channel
//! - **Publishing never fails**: zero handlers is fine
//! - **In-memory only**: events are not persisted or replayed
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::default();
//! let sub = bus.subscribe::<UserCreated, _>(handler_fn(|e: UserCreated| async move {
//!     println!("welcome {}", e.user_id);
//!     Ok(())
//! }));
//!
//! bus.publish(UserCreated { user_id: 7 }).await;
//! sub.unsubscribe();
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info};

use crate::aggregate::EventPublisher;
use crate::config::EventHandlerMode;
use crate::core::{Event, EventEnvelope, MessageKey, MessageKind};
use crate::error::{panic_message, CqrsError};
use crate::handler::{AnyEventHandler, EventHandler, EventHandlerBinding};
use crate::stream::{EventStream, StreamHub};
use crate::subscription::{next_subscription_id, Subscription};
use crate::unhandled::{ExceptionSource, UnhandledExceptionBus, UnhandledExceptionInfo};

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    name: &'static str,
    handler: Arc<dyn AnyEventHandler>,
}

struct EventBusInner {
    handlers: DashMap<MessageKey, Vec<HandlerEntry>>,
    stream: StreamHub,
    exceptions: UnhandledExceptionBus,
    mode: EventHandlerMode,
}

/// Publishes events to handlers and to the saga stream.
///
/// Cheap to clone; clones share handlers, stream subscribers, and the
/// exception channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// Create an event bus reporting handler failures to `exceptions`.
    pub fn new(exceptions: UnhandledExceptionBus, mode: EventHandlerMode) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                handlers: DashMap::new(),
                stream: StreamHub::new(),
                exceptions,
                mode,
            }),
        }
    }

    /// Register event handlers, one subscription per binding.
    ///
    /// Handlers for the same event type run in registration order.
    pub fn register<I>(&self, bindings: I) -> Vec<Subscription>
    where
        I: IntoIterator<Item = EventHandlerBinding>,
    {
        bindings
            .into_iter()
            .map(|binding| self.add(binding))
            .collect()
    }

    /// Register a single event handler.
    pub fn subscribe<E, H>(&self, handler: H) -> Subscription
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.add(EventHandlerBinding::new::<E, H>(handler))
    }

    fn add(&self, binding: EventHandlerBinding) -> Subscription {
        let id = next_subscription_id();
        let key = binding.key;

        info!(event = key.type_name(), handler = binding.name, "event handler registered");
        self.inner
            .handlers
            .entry(key)
            .or_default()
            .push(HandlerEntry {
                id,
                name: binding.name,
                handler: binding.handler,
            });

        let weak: Weak<EventBusInner> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(mut entries) = inner.handlers.get_mut(&key) {
                    entries.retain(|entry| entry.id != id);
                }
                debug!(event = key.type_name(), subscription = id, "event handler unsubscribed");
            }
        })
    }

    /// Publish one event and wait for its handlers to finish.
    pub async fn publish<E: Event>(&self, event: E) {
        self.publish_envelope(EventEnvelope::new(event)).await;
    }

    /// Publish events one at a time, in order.
    pub async fn publish_all<E, I>(&self, events: I)
    where
        E: Event,
        I: IntoIterator<Item = E>,
    {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Publish a type-erased event.
    pub async fn publish_envelope(&self, envelope: EventEnvelope) {
        self.inner.stream.push(&envelope);

        // Snapshot so handlers can subscribe/unsubscribe while running.
        let handlers: Vec<HandlerEntry> = self
            .inner
            .handlers
            .get(&envelope.key())
            .map(|entries| entries.clone())
            .unwrap_or_default();

        debug!(
            event = envelope.type_name(),
            handlers = handlers.len(),
            mode = %self.inner.mode,
            "publishing event"
        );

        match self.inner.mode {
            EventHandlerMode::Concurrent => {
                join_all(handlers.iter().map(|entry| self.invoke(entry, &envelope))).await;
            }
            EventHandlerMode::Sequential => {
                for entry in &handlers {
                    self.invoke(entry, &envelope).await;
                }
            }
        }
    }

    /// Publish type-erased events one at a time, in order.
    pub async fn publish_envelopes<I>(&self, envelopes: I)
    where
        I: IntoIterator<Item = EventEnvelope>,
    {
        for envelope in envelopes {
            self.publish_envelope(envelope).await;
        }
    }

    async fn invoke(&self, entry: &HandlerEntry, envelope: &EventEnvelope) {
        // AssertUnwindSafe: handlers are shared and outlive the panic
        let result = AssertUnwindSafe(entry.handler.handle_any(envelope))
            .catch_unwind()
            .await;

        // Always tagged to this event, even when the handler failed on a nested dispatch.
        let source = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(panic) => anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
        };
        let error = CqrsError::HandlerExecution {
            kind: MessageKind::Event,
            type_name: envelope.type_name(),
            source,
        };

        self.inner.exceptions.publish(UnhandledExceptionInfo::new(
            ExceptionSource::EventHandler {
                handler: entry.name.to_string(),
            },
            Some(envelope.message_ref()),
            error,
        ));
    }

    /// Subscribe to every event published from now on.
    pub fn stream(&self) -> EventStream {
        self.inner.stream.subscribe()
    }

    pub fn stream_subscriber_count(&self) -> usize {
        self.inner.stream.subscriber_count()
    }

    /// Number of live handlers for `E`.
    pub fn handler_count<E: Event>(&self) -> usize {
        self.inner
            .handlers
            .get(&MessageKey::of::<E>())
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn mode(&self) -> EventHandlerMode {
        self.inner.mode
    }

    /// The channel handler failures are reported on.
    pub fn exceptions(&self) -> &UnhandledExceptionBus {
        &self.inner.exceptions
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(UnhandledExceptionBus::new(), EventHandlerMode::default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.inner.handlers.len())
            .field("mode", &self.inner.mode)
            .finish()
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish_events(&self, events: Vec<EventEnvelope>) {
        self.publish_envelopes(events).await;
    }
}
