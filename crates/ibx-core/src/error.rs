//! Error taxonomy for the inbox engine.
//!
//! Configuration problems surface at build/register time; steady-state
//! failures are either retried inside the storage layer (transient), logged
//! and survived by the processing loop (permanent read-side), or returned to
//! the caller (write-side).

use std::fmt;

#[derive(Debug)]
pub enum InboxError {
    /// Invalid options, duplicate inbox, invalid identifier, handler/mode
    /// mismatch. Never raised at steady state.
    Config(String),
    /// Lookup of an inbox by name failed.
    InboxNotFound(String),
    /// A message failed writer-side validation (e.g. FIFO without group id).
    InvalidMessage(String),
    /// No handler registered for `(inbox, message_type)`.
    HandlerNotRegistered { inbox: String, message_type: String },
    /// Payload could not be serialized on the write path.
    Serialization(String),
    /// A storage operation failed permanently (after retry policy).
    Storage(anyhow::Error),
}

impl fmt::Display for InboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboxError::Config(msg) => write!(f, "configuration error: {msg}"),
            InboxError::InboxNotFound(name) => write!(f, "inbox '{name}' is not registered"),
            InboxError::InvalidMessage(msg) => write!(f, "invalid message: {msg}"),
            InboxError::HandlerNotRegistered {
                inbox,
                message_type,
            } => {
                write!(f, "no handler registered for message type '{message_type}' on inbox '{inbox}'")
            }
            InboxError::Serialization(msg) => write!(f, "serialization error: {msg}"),
            InboxError::Storage(err) => write!(f, "storage error: {err:#}"),
        }
    }
}

impl std::error::Error for InboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InboxError::Storage(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for InboxError {
    fn from(err: anyhow::Error) -> Self {
        InboxError::Storage(err)
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;
