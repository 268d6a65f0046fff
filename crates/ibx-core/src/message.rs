//! The durable message unit and its dead-letter sibling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted inbox message.
///
/// Lifecycle: **pending** (`captured_at` is `None`) → **captured** (both
/// `captured_at` and `captured_by` set) → removed on completion, or moved to
/// the dead-letter store. A captured message whose lock has outlived
/// `max_processing_time` is *stale* and treated as pending again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub inbox_name: String,
    /// Registry key resolving to the payload's native type.
    pub message_type: String,
    /// Opaque serialized payload.
    pub payload: String,
    /// FIFO partition key. Never `Some("")` — the writer rejects empty groups.
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    /// Bumped only on the fail path; release leaves it untouched.
    pub attempts_count: i32,
    pub received_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub captured_by: Option<String>,
}

impl Message {
    pub fn is_captured(&self) -> bool {
        self.captured_at.is_some()
    }

    /// A captured message whose lock expired is eligible for re-capture by
    /// any worker.
    pub fn is_stale(&self, now: DateTime<Utc>, max_processing_time: Duration) -> bool {
        match self.captured_at {
            Some(at) => at + max_processing_time < now,
            None => false,
        }
    }

    /// Pending, or captured but past its staleness cutoff.
    pub fn is_capturable(&self, now: DateTime<Utc>, max_processing_time: Duration) -> bool {
        !self.is_captured() || self.is_stale(now, max_processing_time)
    }

    /// Ordering key for capture: `received_at` ascending with the id bytes as
    /// a stable tiebreaker.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.received_at, self.id)
    }

    pub fn clear_capture(&mut self) {
        self.captured_at = None;
        self.captured_by = None;
    }
}

/// A frozen copy of a message that exceeded retry policy or was explicitly
/// rejected by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: Uuid,
    pub inbox_name: String,
    pub message_type: String,
    pub payload: String,
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    pub attempts_count: i32,
    pub received_at: DateTime<Utc>,
    pub failure_reason: String,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    /// Freeze `message` into its dead-letter form.
    pub fn from_message(message: &Message, failure_reason: impl Into<String>, moved_at: DateTime<Utc>) -> Self {
        Self {
            id: message.id,
            inbox_name: message.inbox_name.clone(),
            message_type: message.message_type.clone(),
            payload: message.payload.clone(),
            group_id: message.group_id.clone(),
            collapse_key: message.collapse_key.clone(),
            deduplication_id: message.deduplication_id.clone(),
            attempts_count: message.attempts_count,
            received_at: message.received_at,
            failure_reason: failure_reason.into(),
            moved_at,
        }
    }

    /// Thaw back into a pending message with the attempt counter reset, used
    /// by dead-letter requeue.
    pub fn into_pending(self) -> Message {
        Message {
            id: self.id,
            inbox_name: self.inbox_name,
            message_type: self.message_type,
            payload: self.payload,
            group_id: self.group_id,
            collapse_key: self.collapse_key,
            deduplication_id: self.deduplication_id,
            attempts_count: 0,
            received_at: self.received_at,
            captured_at: None,
            captured_by: None,
        }
    }
}
