//! Structured error type for the runtime.
//!
//! `CqrsError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! Handlers, interceptors, and sagas return `anyhow::Result` (ergonomic for
//! application code). Whatever crosses a bus boundary back to a caller, or
//! onto the unhandled exception channel, is a `CqrsError`.
//!
//! # Example
//!
//! ```ignore
//! match command_bus.execute(CreateUser { name }).await {
//!     Ok(user_id) => println!("created {user_id}"),
//!     Err(CqrsError::HandlerNotFound { type_name, .. }) => {
//!         eprintln!("nothing handles {type_name}");
//!     }
//!     Err(CqrsError::HandlerExecution { source, .. }) => {
//!         if let Some(domain) = source.downcast_ref::<UserError>() {
//!             // the handler's own error, unchanged
//!         }
//!     }
//!     Err(other) => eprintln!("{other}"),
//! }
//! ```

use std::any::Any;

use thiserror::Error;

use crate::core::MessageKind;

/// Structured error type for registration and dispatch.
#[derive(Debug, Error)]
pub enum CqrsError {
    /// A second handler was registered for a command or query type.
    ///
    /// Raised at registration time. The first registration stays active.
    #[error("{kind} handler already registered for {type_name}")]
    DuplicateHandler {
        kind: MessageKind,
        type_name: &'static str,
    },

    /// No handler is registered for the dispatched command or query type.
    #[error("no {kind} handler registered for {type_name}")]
    HandlerNotFound {
        kind: MessageKind,
        type_name: &'static str,
    },

    /// A handler or interceptor failed (or panicked).
    ///
    /// `source` is the error the handler returned, unchanged.
    #[error("{kind} handler for {type_name} failed: {source}")]
    HandlerExecution {
        kind: MessageKind,
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A saga's output stream terminated with an error.
    #[error("saga {saga} stream failed: {source}")]
    SagaStream {
        saga: String,
        #[source]
        source: anyhow::Error,
    },

    /// An interceptor forwarded a command of a different type than the handler expects.
    #[error("command type mismatch: expected {expected}, got {actual}")]
    CommandTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// An event envelope reached a handler registered for another event type.
    #[error("event type mismatch: expected {expected}, got {actual}")]
    EventTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// No Tokio runtime was available to run a saga.
    ///
    /// Sagas run in their own task, so registering one needs a runtime.
    #[error("saga {saga} needs a running Tokio runtime")]
    RuntimeUnavailable { saga: String },

    /// An interceptor replaced a command's result with a value of the wrong type.
    #[error("output type mismatch for {command}: expected {expected}, got {actual}")]
    OutputTypeMismatch {
        command: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
}

impl CqrsError {
    /// Wrap a handler/interceptor failure.
    ///
    /// Everything a handler returns becomes `HandlerExecution` for the
    /// dispatched type, including a `CqrsError` from a nested dispatch, which
    /// stays reachable as `source`. Only the type mismatches raised by the bus
    /// itself while unwrapping envelopes pass through.
    pub(crate) fn from_handler(
        kind: MessageKind,
        type_name: &'static str,
        error: anyhow::Error,
    ) -> Self {
        let is_mismatch = matches!(
            error.downcast_ref::<CqrsError>(),
            Some(
                CqrsError::CommandTypeMismatch { .. }
                    | CqrsError::EventTypeMismatch { .. }
                    | CqrsError::OutputTypeMismatch { .. }
            )
        );
        let error = if is_mismatch {
            match error.downcast::<CqrsError>() {
                Ok(mismatch) => return mismatch,
                Err(error) => error,
            }
        } else {
            error
        };

        CqrsError::HandlerExecution {
            kind,
            type_name,
            source: error,
        }
    }

    pub fn is_duplicate_handler(&self) -> bool {
        matches!(self, CqrsError::DuplicateHandler { .. })
    }

    pub fn is_handler_not_found(&self) -> bool {
        matches!(self, CqrsError::HandlerNotFound { .. })
    }

    pub fn is_handler_execution(&self) -> bool {
        matches!(self, CqrsError::HandlerExecution { .. })
    }

    pub fn is_saga_stream(&self) -> bool {
        matches!(self, CqrsError::SagaStream { .. })
    }

    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, CqrsError::RuntimeUnavailable { .. })
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("user {0} already exists")]
    struct UserExists(String);

    #[test]
    fn test_duplicate_handler_display() {
        let err = CqrsError::DuplicateHandler {
            kind: MessageKind::Command,
            type_name: "CreateUser",
        };
        assert_eq!(
            err.to_string(),
            "command handler already registered for CreateUser"
        );
        assert!(err.is_duplicate_handler());
    }

    #[test]
    fn test_handler_not_found_display() {
        let err = CqrsError::HandlerNotFound {
            kind: MessageKind::Query,
            type_name: "GetUser",
        };
        assert_eq!(err.to_string(), "no query handler registered for GetUser");
        assert!(err.is_handler_not_found());
    }

    #[test]
    fn test_from_handler_wraps_domain_errors_unchanged() {
        let err = CqrsError::from_handler(
            MessageKind::Command,
            "CreateUser",
            UserExists("ada".into()).into(),
        );

        match &err {
            CqrsError::HandlerExecution { source, type_name, .. } => {
                assert_eq!(*type_name, "CreateUser");
                let domain = source.downcast_ref::<UserExists>().unwrap();
                assert_eq!(domain.0, "ada");
            }
            other => panic!("expected HandlerExecution, got {other:?}"),
        }
        assert!(err.to_string().contains("user ada already exists"));
    }

    #[test]
    fn test_from_handler_wraps_nested_dispatch_errors() {
        let nested: anyhow::Error = CqrsError::HandlerNotFound {
            kind: MessageKind::Command,
            type_name: "Nested",
        }
        .into();

        let err = CqrsError::from_handler(MessageKind::Command, "Outer", nested);
        assert!(err.is_handler_execution());
        match err {
            CqrsError::HandlerExecution { type_name, source, .. } => {
                assert_eq!(type_name, "Outer");
                let inner = source.downcast_ref::<CqrsError>().unwrap();
                assert!(inner.is_handler_not_found());
            }
            other => panic!("expected HandlerExecution, got {other:?}"),
        }
    }

    #[test]
    fn test_from_handler_keeps_type_mismatches() {
        let mismatch: anyhow::Error = CqrsError::OutputTypeMismatch {
            command: "Outer",
            expected: "u64",
            actual: "alloc::string::String",
        }
        .into();

        let err = CqrsError::from_handler(MessageKind::Command, "Outer", mismatch);
        assert!(matches!(err, CqrsError::OutputTypeMismatch { .. }));
    }

    #[test]
    fn test_source_chain_is_exposed() {
        use std::error::Error as _;

        let err = CqrsError::SagaStream {
            saga: "welcome".into(),
            source: anyhow::anyhow!("upstream closed"),
        };
        assert!(err.is_saga_stream());
        assert_eq!(err.source().unwrap().to_string(), "upstream closed");
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = CqrsError::HandlerNotFound {
            kind: MessageKind::Command,
            type_name: "TestCommand",
        }
        .into();

        let cqrs = err.downcast_ref::<CqrsError>().unwrap();
        assert!(cqrs.is_handler_not_found());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
