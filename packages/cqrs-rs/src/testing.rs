//! Testing utilities for wiring and asserting on CQRS flows.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! cqrs = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use cqrs::testing::{CommandRecorder, ExceptionRecorder};
//!
//! let welcomes = CommandRecorder::<SendWelcomeEmail>::new();
//! let failures = ExceptionRecorder::new();
//!
//! module.bootstrap(
//!     &Registrations::new()
//!         .with_command::<SendWelcomeEmail, _>(welcomes.clone())
//!         .with_saga(welcome_saga()),
//! )?;
//! module.subscribe_unhandled_exceptions(failures.clone());
//!
//! module.publish_event(UserCreated { user_id: 7 }).await;
//!
//! assert!(welcomes.wait_for(1, Duration::from_secs(1)).await);
//! assert!(failures.is_empty());
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::Command;
use crate::handler::CommandHandler;
use crate::unhandled::{UnhandledExceptionInfo, UnhandledExceptionObserver};

// =============================================================================
// Shared log
// =============================================================================

/// Append-only log that async tests can wait on.
struct Log<T> {
    items: Mutex<Vec<T>>,
    changed: Notify,
}

impl<T: Clone> Log<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    fn push(&self, item: T) {
        self.lock().push(item);
        self.changed.notify_waiters();
    }

    fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                // Register before checking so a push in between is not missed.
                let notified = self.changed.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Command Recorder
// =============================================================================

/// Command handler that records every command it receives.
///
/// Returns `C::Output::default()`. Clones share the same log.
pub struct CommandRecorder<C> {
    log: Arc<Log<C>>,
}

impl<C: Command> CommandRecorder<C> {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Log::new()),
        }
    }

    /// Commands received so far, in arrival order.
    pub fn recorded(&self) -> Vec<C> {
        self.log.snapshot()
    }

    pub fn count(&self) -> usize {
        self.log.len()
    }

    /// Wait until at least `count` commands arrived. `false` on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        self.log.wait_for(count, timeout).await
    }
}

impl<C: Command> Default for CommandRecorder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for CommandRecorder<C> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
        }
    }
}

#[async_trait]
impl<C> CommandHandler<C> for CommandRecorder<C>
where
    C: Command,
    C::Output: Default,
{
    async fn execute(&self, command: C) -> Result<C::Output> {
        self.log.push(command);
        Ok(C::Output::default())
    }
}

// =============================================================================
// Exception Recorder
// =============================================================================

/// Observer that keeps every unhandled exception record.
#[derive(Clone)]
pub struct ExceptionRecorder {
    log: Arc<Log<UnhandledExceptionInfo>>,
}

impl ExceptionRecorder {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Log::new()),
        }
    }

    pub fn records(&self) -> Vec<UnhandledExceptionInfo> {
        self.log.snapshot()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` records arrived. `false` on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        self.log.wait_for(count, timeout).await
    }
}

impl Default for ExceptionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl UnhandledExceptionObserver for ExceptionRecorder {
    fn on_exception(&self, info: &UnhandledExceptionInfo) {
        self.log.push(info.clone());
    }
}
