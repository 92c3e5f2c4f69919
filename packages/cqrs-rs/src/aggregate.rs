//! Aggregate roots that record events and publish them on commit.
//!
//! An aggregate applies events to itself while handling a command, then the
//! command handler commits them once the state change is accepted:
//!
//! ```ignore
//! struct User {
//!     root: AggregateRoot,
//!     id: u64,
//!     name: String,
//! }
//!
//! impl User {
//!     fn rename(&mut self, name: String) {
//!         self.name = name.clone();
//!         self.root.apply(UserRenamed { user_id: self.id, name });
//!     }
//! }
//!
//! // in the command handler
//! let mut user = repo.load(cmd.user_id).await?;
//! user.rename(cmd.name);
//! repo.save(&user).await?;
//! user.root.commit_to(&event_bus).await;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::{Event, EventEnvelope};

/// Something that can publish a batch of events, in order.
///
/// Implemented by [`EventBus`](crate::EventBus).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_events(&self, events: Vec<EventEnvelope>);
}

/// Records applied events until they are committed.
#[derive(Default)]
pub struct AggregateRoot {
    uncommitted: Vec<EventEnvelope>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl AggregateRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the publisher used by [`commit`](Self::commit).
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn set_publisher(&mut self, publisher: Arc<dyn EventPublisher>) {
        self.publisher = Some(publisher);
    }

    /// Record an event for the next commit.
    pub fn apply<E: Event>(&mut self, event: E) {
        self.uncommitted.push(EventEnvelope::new(event));
    }

    /// Events applied since the last commit, oldest first.
    pub fn uncommitted(&self) -> &[EventEnvelope] {
        &self.uncommitted
    }

    /// Discard uncommitted events without publishing them.
    pub fn uncommit(&mut self) {
        self.uncommitted.clear();
    }

    /// Publish uncommitted events through the attached publisher.
    ///
    /// Returns how many events were published. Without a publisher nothing is
    /// published and the events stay uncommitted.
    pub async fn commit(&mut self) -> usize {
        let Some(publisher) = self.publisher.clone() else {
            warn!(
                pending = self.uncommitted.len(),
                "aggregate commit without a publisher, events kept"
            );
            return 0;
        };
        self.commit_to(publisher.as_ref()).await
    }

    /// Publish uncommitted events through `publisher`.
    pub async fn commit_to(&mut self, publisher: &dyn EventPublisher) -> usize {
        let events = std::mem::take(&mut self.uncommitted);
        let count = events.len();
        if count > 0 {
            debug!(events = count, "committing aggregate events");
            publisher.publish_events(events).await;
        }
        count
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher.is_some()
    }
}

impl std::fmt::Debug for AggregateRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("uncommitted", &self.uncommitted)
            .field("has_publisher", &self.has_publisher())
            .finish()
    }
}
