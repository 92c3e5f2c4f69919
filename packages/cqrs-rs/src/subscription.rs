//! Cancelable subscription handles.
//!
//! Event handler registrations, saga subscriptions, and unhandled exception
//! observers all hand back a [`Subscription`].
//!
//! # Lifetime
//!
//! Subscriptions are process-lifetime by default. Dropping the handle does
//! **not** cancel anything; only [`Subscription::unsubscribe`] does. Canceling
//! stops future invocations; in-flight invocations run to completion.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique subscription id.
pub(crate) fn next_subscription_id() -> u64 {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

type CancelFn = Box<dyn FnOnce() + Send>;

struct SubscriptionInner {
    id: u64,
    closed: AtomicBool,
    cancel: Mutex<Option<CancelFn>>,
}

/// Handle to a live link between a producer and a consumer.
///
/// Cheap to clone; all clones control the same subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Create a subscription whose cancellation runs `cancel` exactly once.
    pub(crate) fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id,
                closed: AtomicBool::new(false),
                cancel: Mutex::new(Some(Box::new(cancel))),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Cancel the subscription.
    ///
    /// Idempotent: calling it again (or on a clone) is a no-op.
    pub fn unsubscribe(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cancel) = self.take_cancel() {
            cancel();
        }
    }

    /// Returns true once the subscription was canceled or its producer ended.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark closed without running the cancel hook (the producer ended on its own).
    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        drop(self.take_cancel());
    }

    fn take_cancel(&self) -> Option<CancelFn> {
        // Recover from poisoning; the slot is only ever taken.
        match self.inner.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
