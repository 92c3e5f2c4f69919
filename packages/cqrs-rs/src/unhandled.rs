//! Unhandled exception channel.
//!
//! Failures with no caller to return to end up here: event handler errors and
//! panics, saga-emitted commands that fail, and saga streams that terminate
//! with an error. Observers see every record published after they subscribe.
//!
//! Publishing never fails. With no observers the record is dropped (after the
//! optional `error!` log line); a panicking observer is contained and the rest
//! still run.
//!
//! # Example
//!
//! ```ignore
//! let (mut rx, _sub) = module.unhandled_exceptions().subscribe_channel();
//! tokio::spawn(async move {
//!     while let Some(info) = rx.recv().await {
//!         alerting.send(info.report().to_json()?).await?;
//!     }
//! });
//! ```

use std::error::Error as _;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::{MessageKind, MessageRef};
use crate::error::{panic_message, CqrsError};
use crate::subscription::{next_subscription_id, Subscription};

/// Where an unhandled exception was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExceptionSource {
    /// An event handler returned an error or panicked.
    EventHandler { handler: String },
    /// A saga's command failed, or its stream ended with an error.
    Saga { saga: String },
}

impl fmt::Display for ExceptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionSource::EventHandler { handler } => write!(f, "event handler {handler}"),
            ExceptionSource::Saga { saga } => write!(f, "saga {saga}"),
        }
    }
}

/// One failure record.
#[derive(Debug, Clone)]
pub struct UnhandledExceptionInfo {
    pub id: Uuid,
    pub source: ExceptionSource,
    /// The event or command being processed.
    ///
    /// `None` for saga stream failures: the stream itself failed, not a
    /// message. The saga is named in `source`.
    pub cause: Option<MessageRef>,
    pub error: Arc<CqrsError>,
    pub occurred_at: DateTime<Utc>,
}

impl UnhandledExceptionInfo {
    pub fn new(source: ExceptionSource, cause: Option<MessageRef>, error: CqrsError) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            cause,
            error: Arc::new(error),
            occurred_at: Utc::now(),
        }
    }

    /// Serializable summary for log shipping and telemetry.
    pub fn report(&self) -> UnhandledExceptionReport {
        let mut error_chain = Vec::new();
        let mut next = self.error.source();
        while let Some(err) = next {
            error_chain.push(err.to_string());
            next = err.source();
        }

        UnhandledExceptionReport {
            id: self.id,
            source: self.source.clone(),
            cause_kind: self.cause.as_ref().map(|c| c.kind()),
            cause_type: self.cause.as_ref().map(|c| c.type_name().to_string()),
            error: self.error.to_string(),
            error_chain,
            occurred_at: self.occurred_at,
        }
    }
}

/// Plain-data form of [`UnhandledExceptionInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnhandledExceptionReport {
    pub id: Uuid,
    pub source: ExceptionSource,
    pub cause_kind: Option<MessageKind>,
    pub cause_type: Option<String>,
    pub error: String,
    /// Source chain below `error`, outermost first.
    pub error_chain: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

impl UnhandledExceptionReport {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Receives every record published on the channel.
///
/// Called inline by the publisher; hand off to a task or channel for slow work.
pub trait UnhandledExceptionObserver: Send + Sync + 'static {
    fn on_exception(&self, info: &UnhandledExceptionInfo);
}

struct ObserverFn<F>(F);

impl<F> UnhandledExceptionObserver for ObserverFn<F>
where
    F: Fn(&UnhandledExceptionInfo) + Send + Sync + 'static,
{
    fn on_exception(&self, info: &UnhandledExceptionInfo) {
        (self.0)(info)
    }
}

struct ChannelObserver(mpsc::UnboundedSender<UnhandledExceptionInfo>);

impl UnhandledExceptionObserver for ChannelObserver {
    fn on_exception(&self, info: &UnhandledExceptionInfo) {
        // Receiver gone means the consumer stopped listening.
        let _ = self.0.send(info.clone());
    }
}

struct ChannelInner {
    observers: DashMap<u64, Arc<dyn UnhandledExceptionObserver>>,
    log: bool,
}

/// Multicast side channel for failures with no direct caller.
#[derive(Clone)]
pub struct UnhandledExceptionBus {
    inner: Arc<ChannelInner>,
}

impl UnhandledExceptionBus {
    /// Create a channel that logs every record with `error!`.
    pub fn new() -> Self {
        Self::with_logging(true)
    }

    pub fn with_logging(log: bool) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                observers: DashMap::new(),
                log,
            }),
        }
    }

    /// Deliver `info` to every current observer.
    pub fn publish(&self, info: UnhandledExceptionInfo) {
        if self.inner.log {
            error!(
                id = %info.id,
                source = %info.source,
                cause = info.cause.as_ref().map(|c| c.type_name()).unwrap_or("none"),
                error = %info.error,
                "unhandled exception"
            );
        }

        // Snapshot so observers can (un)subscribe from inside the callback.
        let observers: Vec<_> = self
            .inner
            .observers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        if observers.is_empty() {
            debug!(id = %info.id, "no unhandled exception observers, record dropped");
            return;
        }

        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer.on_exception(&info))) {
                warn!(
                    id = %info.id,
                    panic = %panic_message(panic.as_ref()),
                    "unhandled exception observer panicked"
                );
            }
        }
    }

    /// Add an observer. It sees records published from now on.
    pub fn subscribe<O: UnhandledExceptionObserver>(&self, observer: O) -> Subscription {
        let id = next_subscription_id();
        self.inner.observers.insert(id, Arc::new(observer));

        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.remove(&id);
            }
        })
    }

    pub fn subscribe_fn<F>(&self, f: F) -> Subscription
    where
        F: Fn(&UnhandledExceptionInfo) + Send + Sync + 'static,
    {
        self.subscribe(ObserverFn(f))
    }

    /// Receive records on an unbounded channel.
    pub fn subscribe_channel(&self) -> (mpsc::UnboundedReceiver<UnhandledExceptionInfo>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (rx, self.subscribe(ChannelObserver(tx)))
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }
}

impl Default for UnhandledExceptionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UnhandledExceptionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnhandledExceptionBus")
            .field("observers", &self.observer_count())
            .field("log", &self.inner.log)
            .finish()
    }
}
