//! Message-type contracts and the type ↔ inbox registry.
//!
//! A payload type opts into write-time behavior by overriding the default
//! trait methods below. The overrides are resolved statically when the type
//! is registered — there is no per-message type inspection at runtime.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{InboxError, Result};

/// Contract for payload types written to an inbox.
///
/// `MESSAGE_TYPE` is the registry key stored alongside the payload; it must
/// be unique across the process. The optional accessors influence how the
/// writer persists the message:
///
/// - [`external_id`](InboxMessage::external_id) supplies the message id
///   (a fresh UUID otherwise),
/// - [`group_id`](InboxMessage::group_id) is the FIFO partition key,
///   required non-empty on FIFO inboxes,
/// - [`collapse_key`](InboxMessage::collapse_key) makes a newer write delete
///   earlier pending messages with the same key,
/// - [`deduplication_id`](InboxMessage::deduplication_id) blocks duplicate
///   writes for the deduplication interval,
/// - [`received_at`](InboxMessage::received_at) overrides the write
///   timestamp.
pub trait InboxMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;

    fn external_id(&self) -> Option<Uuid> {
        None
    }

    fn group_id(&self) -> Option<String> {
        None
    }

    fn collapse_key(&self) -> Option<String> {
        None
    }

    fn deduplication_id(&self) -> Option<String> {
        None
    }

    fn received_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Process-wide bijection between message-type keys and their default inbox.
///
/// Populated while the manager is built, read-only afterwards. The writer
/// uses it to route messages that were not addressed to an explicit inbox.
#[derive(Debug, Default)]
pub struct MessageTypeRegistry {
    default_inbox: HashMap<&'static str, String>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, message_type: &'static str, inbox_name: &str) -> Result<()> {
        if message_type.is_empty() {
            return Err(InboxError::Config("message type key must not be empty".into()));
        }
        match self.default_inbox.get(message_type) {
            Some(existing) if existing == inbox_name => Ok(()),
            Some(existing) => Err(InboxError::Config(format!(
                "message type '{message_type}' is already registered to inbox '{existing}'"
            ))),
            None => {
                self.default_inbox.insert(message_type, inbox_name.to_string());
                Ok(())
            }
        }
    }

    /// Default inbox for a message type. Absence is a programming error
    /// surfaced to the caller as such.
    pub fn default_inbox_for(&self, message_type: &str) -> Result<&str> {
        self.default_inbox
            .get(message_type)
            .map(String::as_str)
            .ok_or_else(|| {
                InboxError::Config(format!(
                    "message type '{message_type}' is not registered with any inbox"
                ))
            })
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.default_inbox.contains_key(message_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let mut reg = MessageTypeRegistry::new();
        reg.register("order-created", "orders").unwrap();
        assert_eq!(reg.default_inbox_for("order-created").unwrap(), "orders");
        assert!(reg.default_inbox_for("unknown").is_err());
    }

    #[test]
    fn conflicting_registration_rejected() {
        let mut reg = MessageTypeRegistry::new();
        reg.register("order-created", "orders").unwrap();
        // Same pair is idempotent, different inbox is not.
        reg.register("order-created", "orders").unwrap();
        assert!(reg.register("order-created", "billing").is_err());
    }
}
