//! The storage provider contract.
//!
//! One provider value encapsulates one backing store for one named inbox.
//! Implementations must be safe for concurrent calls; the engine issues
//! captures, batch commits, and lock extensions from different tasks at
//! once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::{DeadLetterMessage, Message};

/// The four result subsets committed after a strategy pass. Any subset may
/// be empty. Backends must apply all four atomically (one transaction or
/// one pipeline) and in one network round-trip where the backend allows.
#[derive(Debug, Clone, Default)]
pub struct ProcessResults {
    pub complete: Vec<Uuid>,
    pub fail: Vec<Uuid>,
    pub release: Vec<Uuid>,
    pub dead_letter: Vec<(Uuid, String)>,
}

impl ProcessResults {
    pub fn is_empty(&self) -> bool {
        self.complete.is_empty()
            && self.fail.is_empty()
            && self.release.is_empty()
            && self.dead_letter.is_empty()
    }

    pub fn len(&self) -> usize {
        self.complete.len() + self.fail.len() + self.release.len() + self.dead_letter.len()
    }
}

/// Point-in-time store counters used for health evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageHealthMetrics {
    pub pending: u64,
    pub captured: u64,
    pub dead_letter: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Abstract persistence for one named inbox.
///
/// Atomicity requirements called out per operation are part of the
/// contract, not an implementation detail — the engine's at-least-once
/// guarantees depend on them.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn inbox_name(&self) -> &str;

    /// Persist a batch. Per message, in order:
    ///
    /// 1. If `collapse_key` is set, delete all *pending* messages of this
    ///    inbox with the same key, atomically with the insert.
    /// 2. If `deduplication_id` is set and deduplication is enabled, insert
    ///    only if no deduplication record exists for the id; on conflict the
    ///    message is silently dropped and no record is written.
    /// 3. Otherwise insert.
    async fn write_batch(&self, messages: Vec<Message>) -> anyhow::Result<()>;

    async fn write(&self, message: Message) -> anyhow::Result<()> {
        self.write_batch(vec![message]).await
    }

    /// Atomically select up to the configured read batch of pending-or-stale
    /// messages, oldest `received_at` first (id as tiebreaker), and mark
    /// them captured by `processor_id`. Concurrent captures must skip each
    /// other's rows rather than block. FIFO providers additionally skip
    /// groups holding a live foreign lock and acquire/refresh the group
    /// lock as part of the same atomic step.
    async fn read_and_capture(&self, processor_id: &str) -> anyhow::Result<Vec<Message>>;

    /// Bump `attempts_count` and clear capture. Max-attempts policy lives in
    /// the engine, not here.
    async fn fail_batch(&self, ids: &[Uuid]) -> anyhow::Result<()>;

    async fn fail(&self, id: Uuid) -> anyhow::Result<()> {
        self.fail_batch(&[id]).await
    }

    /// Clear capture without touching `attempts_count`.
    async fn release_batch(&self, ids: &[Uuid]) -> anyhow::Result<()>;

    async fn release(&self, id: Uuid) -> anyhow::Result<()> {
        self.release_batch(&[id]).await
    }

    /// Copy to the dead-letter store then delete from the primary, as one
    /// atomic step per message. Ids already moved (or unknown) are no-ops.
    async fn move_to_dead_letter_batch(&self, entries: &[(Uuid, String)]) -> anyhow::Result<()>;

    async fn move_to_dead_letter(&self, id: Uuid, reason: &str) -> anyhow::Result<()> {
        self.move_to_dead_letter_batch(&[(id, reason.to_string())]).await
    }

    /// The hot path: completes, fails, releases, and dead-letters in a
    /// single transaction / pipeline. Semantically equivalent to the
    /// individual operations above.
    async fn process_results_batch(&self, results: ProcessResults) -> anyhow::Result<()>;

    /// Oldest-first by `moved_at`.
    async fn read_dead_letters(&self, count: usize) -> anyhow::Result<Vec<DeadLetterMessage>>;

    /// Move dead-letter rows back to the primary store as pending with the
    /// attempt counter reset. Unknown ids are skipped. Returns the number of
    /// rows requeued.
    async fn requeue_dead_letters(&self, ids: &[Uuid]) -> anyhow::Result<u64>;

    /// For each id still captured by `processor_id`, set
    /// `captured_at = new_captured_at` and return how many rows matched.
    /// Rows re-captured by another worker after going stale are silently
    /// skipped. FIFO providers also refresh the matching group locks.
    async fn extend_locks(
        &self,
        processor_id: &str,
        ids: &[Uuid],
        new_captured_at: DateTime<Utc>,
    ) -> anyhow::Result<usize>;

    async fn health_metrics(&self) -> anyhow::Result<StorageHealthMetrics>;

    /// Delete the listed group locks. Idempotent.
    async fn release_group_locks(&self, group_ids: &[String]) -> anyhow::Result<()>;

    /// Atomically clear capture on the listed messages and delete their
    /// group locks. Idempotent. Non-FIFO providers treat this as a plain
    /// release.
    async fn release_messages_and_group_locks(&self, messages: &[Message]) -> anyhow::Result<()>;

    /// Delete at most `batch` deduplication records created before `cutoff`;
    /// returns the number deleted.
    async fn delete_expired_deduplications(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64>;

    /// Delete at most `batch` group locks acquired before `cutoff`; returns
    /// the number deleted.
    async fn delete_expired_group_locks(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64>;

    /// Delete at most `batch` dead-letter rows moved before `cutoff`;
    /// returns the number deleted.
    async fn delete_expired_dead_letters(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64>;

    /// Idempotent schema / keyspace creation.
    async fn migrate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
