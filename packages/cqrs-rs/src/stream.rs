//! The event stream sagas subscribe to.
//!
//! Every event published on the [`EventBus`](crate::EventBus) is pushed to
//! every live [`EventStream`] before any handler runs.
//!
//! # Delivery guarantees
//!
//! - Hot: a stream sees only events published after it was created.
//! - Lossless: each subscriber has its own unbounded queue. A slow saga grows
//!   its queue instead of dropping events or blocking publishers.
//! - Totally ordered: pushes are serialized, so all subscribers observe the
//!   same order.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::core::{Event, EventEnvelope};

/// Fan-out point for published events.
pub(crate) struct StreamHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EventEnvelope>>>,
}

impl StreamHub {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        EventStream { rx }
    }

    /// Push to every live subscriber, pruning the ones that went away.
    pub(crate) fn push(&self, envelope: &EventEnvelope) {
        self.lock().retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<EventEnvelope>>> {
        // Recover from poisoning; the vec is never left half-updated.
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A subscriber's view of the published events.
///
/// Implements [`Stream`]; use [`of_type`](Self::of_type) to narrow it to a
/// single event type.
///
/// ```ignore
/// let welcomes = bus.stream()
///     .of_type::<UserCreated>()
///     .map(|e| SendWelcomeEmail { user_id: e.user_id });
/// ```
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl EventStream {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }

    /// Keep only events of type `E`, yielded as owned values.
    pub fn of_type<E: Event>(self) -> BoxStream<'static, E> {
        self.filter_map(|envelope| async move { envelope.downcast_ref::<E>().cloned() })
            .boxed()
    }
}

impl Stream for EventStream {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
