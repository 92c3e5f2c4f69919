//! Core message traits and type-erased transport types.
//!
//! # Overview
//!
//! The runtime separates three kinds of messages:
//! - [`Command`] = intent to change state, routed to exactly one handler
//! - [`Query`] = request for data, routed to exactly one handler
//! - [`Event`] = fact that something happened, fanned out to any number of handlers
//!
//! Routing is keyed by [`MessageKey`], which is derived from the Rust type of
//! the message. No runtime schema checks are involved.
//!
//! Inside the runtime, messages travel as envelopes ([`CommandEnvelope`],
//! [`EventEnvelope`]) that carry the key next to an `Arc<dyn Any>` payload.
//! Typed APIs on the buses wrap and unwrap envelopes for you; interceptors and
//! sagas work with envelopes directly.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CqrsError;

/// The kind of message a key, handler, or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Query,
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Stable routing identity of a message type.
///
/// Equality and hashing use the `TypeId` only; the type name is carried for
/// error messages and logs.
///
/// ```ignore
/// let key = MessageKey::of::<CreateUser>();
/// assert_eq!(key, MessageKey::of::<CreateUser>());
/// ```
#[derive(Clone, Copy)]
pub struct MessageKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl MessageKey {
    /// Derive the key for a message type.
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified Rust type name (e.g. `app::users::CreateUser`).
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for MessageKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for MessageKey {}

impl Hash for MessageKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageKey").field(&self.type_name).finish()
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// An intent to change state, handled by exactly one handler.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct CreateUser {
///     name: String,
/// }
///
/// impl Command for CreateUser {
///     type Output = u64;
/// }
/// ```
///
/// Commands must be `Clone` so an interceptor can invoke the rest of the chain
/// more than once (e.g. a retry interceptor). The handler receives the value
/// without a copy when no one else holds it.
pub trait Command: Clone + Send + Sync + 'static {
    /// The value the handler produces.
    type Output: Send + 'static;
}

/// A request for data, handled by exactly one handler and never intercepted.
pub trait Query: Clone + Send + Sync + 'static {
    /// The value the handler produces.
    type Output: Send + 'static;
}

/// A fact - something that happened.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Clone + Send + Sync + 'static`. You don't need to implement it manually.
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct UserCreated {
///     user_id: u64,
/// }
/// // Event is automatically implemented!
/// ```
pub trait Event: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Event for T {}

/// Type-erased command together with its routing key.
///
/// Interceptors receive and forward envelopes. To transform a command, read it
/// with [`downcast_ref`](Self::downcast_ref) and forward a new envelope built
/// with [`CommandEnvelope::new`].
#[derive(Clone)]
pub struct CommandEnvelope {
    key: MessageKey,
    payload: Arc<dyn Any + Send + Sync>,
}

impl CommandEnvelope {
    pub fn new<C: Command>(command: C) -> Self {
        Self {
            key: MessageKey::of::<C>(),
            payload: Arc::new(command),
        }
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.type_name()
    }

    /// Returns true if the payload is a `C`.
    pub fn is<C: Command>(&self) -> bool {
        self.payload.is::<C>()
    }

    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.payload.downcast_ref()
    }

    /// Reference to this command for error records.
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            kind: MessageKind::Command,
            key: self.key,
            payload: self.payload.clone(),
        }
    }

    /// Unwrap into the concrete command type.
    ///
    /// Avoids a clone when this envelope holds the only reference.
    pub(crate) fn into_command<C: Command>(self) -> Result<C, CqrsError> {
        let actual = self.key.type_name();
        let command = self
            .payload
            .downcast::<C>()
            .map_err(|_| CqrsError::CommandTypeMismatch {
                expected: type_name::<C>(),
                actual,
            })?;
        Ok(Arc::try_unwrap(command).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl fmt::Debug for CommandEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEnvelope")
            .field("type", &self.key.type_name())
            .finish_non_exhaustive()
    }
}

/// Type-erased result of a command handler.
///
/// Interceptors can inspect the result with [`downcast_ref`](Self::downcast_ref)
/// and replace it with [`CommandOutput::new`]. The replacement must have the
/// command's `Output` type or the caller gets [`CqrsError::OutputTypeMismatch`].
pub struct CommandOutput {
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl CommandOutput {
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            value: Box::new(value),
        }
    }

    /// Type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Take the value out, or get the output back if it is not a `T`.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        let type_name = self.type_name;
        self.value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|value| Self { type_name, value })
    }

    pub(crate) fn into_value<T: 'static>(self, command: &'static str) -> Result<T, CqrsError> {
        self.downcast::<T>()
            .map_err(|output| CqrsError::OutputTypeMismatch {
                command,
                expected: type_name::<T>(),
                actual: output.type_name,
            })
    }
}

impl fmt::Debug for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOutput")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Type-erased event together with its routing key.
///
/// This is what flows through the event stream that sagas observe.
#[derive(Clone)]
pub struct EventEnvelope {
    key: MessageKey,
    payload: Arc<dyn Any + Send + Sync>,
}

impl EventEnvelope {
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            key: MessageKey::of::<E>(),
            payload: Arc::new(event),
        }
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.type_name()
    }

    pub fn is<E: Event>(&self) -> bool {
        self.payload.is::<E>()
    }

    /// Downcast the payload to a concrete event type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.payload.downcast_ref()
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            kind: MessageKind::Event,
            key: self.key,
            payload: self.payload.clone(),
        }
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("type", &self.key.type_name())
            .finish_non_exhaustive()
    }
}

/// The message that triggered an unhandled exception.
#[derive(Clone)]
pub struct MessageRef {
    kind: MessageKind,
    key: MessageKey,
    payload: Arc<dyn Any + Send + Sync>,
}

impl MessageRef {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.key.type_name()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRef")
            .field("kind", &self.kind)
            .field("type", &self.key.type_name())
            .finish_non_exhaustive()
    }
}
