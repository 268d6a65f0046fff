//! ibx-memory
//!
//! In-memory reference implementation of the storage provider contract.
//! Backing structure per inbox: a hash map keyed by message id plus an
//! ordered index keyed by `(received_at, id)`, giving O(1) lookup and
//! ordered capture scans with a stable tiebreak. Staleness, dedup expiry,
//! and group-lock TTLs are soft: evaluated against the clock at read time.
//!
//! Every operation takes the single store mutex, so each call is atomic by
//! construction — the same property the SQL and key-value backends get
//! from transactions and server-side scripts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use ibx_core::message::{DeadLetterMessage, Message};
use ibx_core::options::InboxOptions;
use ibx_core::provider::{ProcessResults, StorageHealthMetrics, StorageProvider};

#[derive(Debug, Clone)]
struct GroupLock {
    locked_at: DateTime<Utc>,
    locked_by: String,
}

#[derive(Debug, Default)]
struct Store {
    messages: HashMap<Uuid, Message>,
    /// Ordered capture index: `(received_at, id)` → id.
    by_received: BTreeMap<(DateTime<Utc>, Uuid), Uuid>,
    group_locks: HashMap<String, GroupLock>,
    /// `deduplication_id` → created_at.
    dedup: HashMap<String, DateTime<Utc>>,
    dead_letters: HashMap<Uuid, DeadLetterMessage>,
}

impl Store {
    fn insert_message(&mut self, message: Message) {
        self.by_received.insert(message.order_key(), message.id);
        self.messages.insert(message.id, message);
    }

    fn remove_message(&mut self, id: Uuid) -> Option<Message> {
        let message = self.messages.remove(&id)?;
        self.by_received.remove(&message.order_key());
        Some(message)
    }
}

/// One in-memory backing store for one named inbox.
pub struct MemoryInboxStore {
    inbox_name: String,
    fifo: bool,
    read_batch_size: usize,
    max_processing_time: Duration,
    enable_deduplication: bool,
    deduplication_interval: Duration,
    state: Mutex<Store>,
}

impl MemoryInboxStore {
    pub fn new(inbox_name: impl Into<String>, options: &InboxOptions) -> Self {
        Self {
            inbox_name: inbox_name.into(),
            fifo: options.delivery_mode.is_fifo(),
            read_batch_size: options.read_batch_size,
            max_processing_time: options.max_processing_time_chrono(),
            enable_deduplication: options.enable_deduplication,
            deduplication_interval: options.deduplication_interval_chrono(),
            state: Mutex::new(Store::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.state.lock().expect("store mutex poisoned")
    }

    fn lock_is_live(&self, lock: &GroupLock, now: DateTime<Utc>) -> bool {
        lock.locked_at + self.max_processing_time > now
    }

    /// Test/diagnostic helper: total number of primary rows.
    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Test/diagnostic helper: live group locks.
    pub fn group_lock_count(&self) -> usize {
        self.lock().group_locks.len()
    }
}

#[async_trait]
impl StorageProvider for MemoryInboxStore {
    fn inbox_name(&self) -> &str {
        &self.inbox_name
    }

    async fn write_batch(&self, messages: Vec<Message>) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut store = self.lock();

        for message in messages {
            // Collapse: the newcomer replaces older pending messages with
            // the same key. Captured messages are left alone.
            if let Some(key) = &message.collapse_key {
                let doomed: Vec<Uuid> = store
                    .messages
                    .values()
                    .filter(|m| !m.is_captured() && m.collapse_key.as_deref() == Some(key))
                    .map(|m| m.id)
                    .collect();
                for id in doomed {
                    store.remove_message(id);
                }
            }

            if self.enable_deduplication {
                if let Some(dedup_id) = &message.deduplication_id {
                    match store.dedup.get(dedup_id) {
                        Some(created_at) if *created_at + self.deduplication_interval > now => {
                            // Duplicate inside the window: drop silently.
                            continue;
                        }
                        _ => {
                            store.dedup.insert(dedup_id.clone(), now);
                        }
                    }
                }
            }

            store.insert_message(message);
        }

        Ok(())
    }

    async fn read_and_capture(&self, processor_id: &str) -> anyhow::Result<Vec<Message>> {
        let now = Utc::now();
        let mut store = self.lock();
        let mut captured: Vec<Message> = Vec::new();

        let candidates: Vec<Uuid> = store.by_received.values().copied().collect();
        for id in candidates {
            if captured.len() >= self.read_batch_size {
                break;
            }
            let Some(message) = store.messages.get(&id) else { continue };
            if !message.is_capturable(now, self.max_processing_time) {
                continue;
            }
            if self.fifo {
                if let Some(group_id) = &message.group_id {
                    if let Some(lock) = store.group_locks.get(group_id) {
                        if self.lock_is_live(lock, now) && lock.locked_by != processor_id {
                            continue;
                        }
                    }
                }
            }

            let group_id = message.group_id.clone();
            let message = store
                .messages
                .get_mut(&id)
                .expect("message present while store is locked");
            message.captured_at = Some(now);
            message.captured_by = Some(processor_id.to_string());
            captured.push(message.clone());

            // Acquire or refresh the group lock in the same atomic step.
            if self.fifo {
                if let Some(group_id) = group_id {
                    store.group_locks.insert(
                        group_id,
                        GroupLock {
                            locked_at: now,
                            locked_by: processor_id.to_string(),
                        },
                    );
                }
            }
        }

        Ok(captured)
    }

    async fn fail_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        let mut store = self.lock();
        for id in ids {
            if let Some(message) = store.messages.get_mut(id) {
                message.attempts_count += 1;
                message.clear_capture();
            }
        }
        Ok(())
    }

    async fn release_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        let mut store = self.lock();
        for id in ids {
            if let Some(message) = store.messages.get_mut(id) {
                message.clear_capture();
            }
        }
        Ok(())
    }

    async fn move_to_dead_letter_batch(&self, entries: &[(Uuid, String)]) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut store = self.lock();
        for (id, reason) in entries {
            // Already-moved and unknown ids are no-ops.
            if let Some(message) = store.remove_message(*id) {
                let dead = DeadLetterMessage::from_message(&message, reason.clone(), now);
                store.dead_letters.insert(dead.id, dead);
            }
        }
        Ok(())
    }

    async fn process_results_batch(&self, results: ProcessResults) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut store = self.lock();

        for id in &results.complete {
            store.remove_message(*id);
        }
        for id in &results.fail {
            if let Some(message) = store.messages.get_mut(id) {
                message.attempts_count += 1;
                message.clear_capture();
            }
        }
        for id in &results.release {
            if let Some(message) = store.messages.get_mut(id) {
                message.clear_capture();
            }
        }
        for (id, reason) in &results.dead_letter {
            if let Some(message) = store.remove_message(*id) {
                let dead = DeadLetterMessage::from_message(&message, reason.clone(), now);
                store.dead_letters.insert(dead.id, dead);
            }
        }

        Ok(())
    }

    async fn read_dead_letters(&self, count: usize) -> anyhow::Result<Vec<DeadLetterMessage>> {
        let store = self.lock();
        let mut dead: Vec<DeadLetterMessage> = store.dead_letters.values().cloned().collect();
        dead.sort_by_key(|d| (d.moved_at, d.id));
        dead.truncate(count);
        Ok(dead)
    }

    async fn requeue_dead_letters(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        let mut store = self.lock();
        let mut requeued = 0u64;
        for id in ids {
            if let Some(dead) = store.dead_letters.remove(id) {
                store.insert_message(dead.into_pending());
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn extend_locks(
        &self,
        processor_id: &str,
        ids: &[Uuid],
        new_captured_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let mut store = self.lock();
        let mut extended = 0usize;
        let mut groups: Vec<String> = Vec::new();

        for id in ids {
            if let Some(message) = store.messages.get_mut(id) {
                if message.captured_by.as_deref() == Some(processor_id) {
                    message.captured_at = Some(new_captured_at);
                    extended += 1;
                    if let Some(group_id) = &message.group_id {
                        groups.push(group_id.clone());
                    }
                }
            }
        }

        if self.fifo {
            for group_id in groups {
                if let Some(lock) = store.group_locks.get_mut(&group_id) {
                    if lock.locked_by == processor_id {
                        lock.locked_at = new_captured_at;
                    }
                }
            }
        }

        Ok(extended)
    }

    async fn health_metrics(&self) -> anyhow::Result<StorageHealthMetrics> {
        let store = self.lock();
        let mut pending = 0u64;
        let mut captured = 0u64;
        let mut oldest_pending_at: Option<DateTime<Utc>> = None;

        for message in store.messages.values() {
            if message.is_captured() {
                captured += 1;
            } else {
                pending += 1;
                if oldest_pending_at.map_or(true, |oldest| message.received_at < oldest) {
                    oldest_pending_at = Some(message.received_at);
                }
            }
        }

        Ok(StorageHealthMetrics {
            pending,
            captured,
            dead_letter: store.dead_letters.len() as u64,
            oldest_pending_at,
        })
    }

    async fn release_group_locks(&self, group_ids: &[String]) -> anyhow::Result<()> {
        let mut store = self.lock();
        for group_id in group_ids {
            store.group_locks.remove(group_id);
        }
        Ok(())
    }

    async fn release_messages_and_group_locks(&self, messages: &[Message]) -> anyhow::Result<()> {
        let mut store = self.lock();
        for message in messages {
            if let Some(stored) = store.messages.get_mut(&message.id) {
                stored.clear_capture();
            }
            if let Some(group_id) = &message.group_id {
                store.group_locks.remove(group_id);
            }
        }
        Ok(())
    }

    async fn delete_expired_deduplications(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let mut store = self.lock();
        let doomed: Vec<String> = store
            .dedup
            .iter()
            .filter(|(_, created_at)| **created_at < cutoff)
            .map(|(key, _)| key.clone())
            .take(batch as usize)
            .collect();
        for key in &doomed {
            store.dedup.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_expired_group_locks(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let mut store = self.lock();
        let doomed: Vec<String> = store
            .group_locks
            .iter()
            .filter(|(_, lock)| lock.locked_at < cutoff)
            .map(|(key, _)| key.clone())
            .take(batch as usize)
            .collect();
        for key in &doomed {
            store.group_locks.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_expired_dead_letters(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let mut store = self.lock();
        let doomed: Vec<Uuid> = store
            .dead_letters
            .values()
            .filter(|dead| dead.moved_at < cutoff)
            .map(|dead| dead.id)
            .take(batch as usize)
            .collect();
        for id in &doomed {
            store.dead_letters.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibx_core::options::DeliveryMode;

    fn options() -> InboxOptions {
        InboxOptions {
            read_batch_size: 10,
            ..Default::default()
        }
    }

    fn fifo_options() -> InboxOptions {
        InboxOptions {
            delivery_mode: DeliveryMode::Fifo,
            read_batch_size: 10,
            ..Default::default()
        }
    }

    fn msg(received_offset_ms: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            inbox_name: "test".into(),
            message_type: "event".into(),
            payload: "{}".into(),
            group_id: None,
            collapse_key: None,
            deduplication_id: None,
            attempts_count: 0,
            received_at: Utc::now() + Duration::milliseconds(received_offset_ms),
            captured_at: None,
            captured_by: None,
        }
    }

    #[tokio::test]
    async fn capture_returns_oldest_first_and_locks_rows() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &options());
        let old = msg(-2000);
        let new = msg(-1000);
        store.write_batch(vec![new.clone(), old.clone()]).await?;

        let captured = store.read_and_capture("w1").await?;
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].id, old.id, "oldest received_at first");
        assert_eq!(captured[0].captured_by.as_deref(), Some("w1"));

        // A second worker finds nothing while the locks are fresh.
        let second = store.read_and_capture("w2").await?;
        assert!(second.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn collapse_deletes_earlier_pending_only() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &options());

        let mut first = msg(-3000);
        first.collapse_key = Some("k".into());
        store.write(first.clone()).await?;

        // Capture the first message so it is no longer pending.
        let captured = store.read_and_capture("w1").await?;
        assert_eq!(captured.len(), 1);

        let mut second = msg(-2000);
        second.collapse_key = Some("k".into());
        let mut third = msg(-1000);
        third.collapse_key = Some("k".into());
        store.write(second.clone()).await?;
        store.write(third.clone()).await?;

        // The captured copy survives; among pending only the latest remains.
        assert_eq!(store.message_count(), 2);
        let captured = store.read_and_capture("w1").await?;
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].id, third.id);
        Ok(())
    }

    #[tokio::test]
    async fn dedup_blocks_second_write_within_window() -> anyhow::Result<()> {
        let opts = InboxOptions {
            enable_deduplication: true,
            deduplication_interval: std::time::Duration::from_secs(3600),
            ..options()
        };
        let store = MemoryInboxStore::new("test", &opts);

        let mut first = msg(-2000);
        first.deduplication_id = Some("x".into());
        first.payload = r#"{"v":1}"#.into();
        let mut second = msg(-1000);
        second.deduplication_id = Some("x".into());
        second.payload = r#"{"v":2}"#.into();

        store.write(first).await?;
        store.write(second).await?;

        let captured = store.read_and_capture("w1").await?;
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].payload, r#"{"v":1}"#, "first write wins");
        Ok(())
    }

    #[tokio::test]
    async fn stale_capture_is_recaptured_with_new_owner() -> anyhow::Result<()> {
        let opts = InboxOptions {
            max_processing_time: std::time::Duration::from_millis(10),
            ..options()
        };
        let store = MemoryInboxStore::new("test", &opts);
        store.write(msg(-1000)).await?;

        let first = store.read_and_capture("w1").await?;
        assert_eq!(first.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let second = store.read_and_capture("w2").await?;
        assert_eq!(second.len(), 1, "stale message is pending again");
        assert_eq!(second[0].captured_by.as_deref(), Some("w2"));
        Ok(())
    }

    #[tokio::test]
    async fn fifo_capture_skips_groups_locked_by_others() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &fifo_options());

        let mut a1 = msg(-3000);
        a1.group_id = Some("g1".into());
        let mut a2 = msg(-2000);
        a2.group_id = Some("g1".into());
        let mut b1 = msg(-1000);
        b1.group_id = Some("g2".into());
        store.write_batch(vec![a1.clone(), a2.clone(), b1.clone()]).await?;

        let w1 = store.read_and_capture("w1").await?;
        assert_eq!(w1.len(), 3, "single worker captures everything in order");

        // Release only the messages, keep g1's lock to simulate a competing
        // worker mid-flight.
        store
            .release_batch(&[a1.id, a2.id, b1.id])
            .await?;
        store.release_group_locks(&["g2".to_string()]).await?;

        let w2 = store.read_and_capture("w2").await?;
        let groups: Vec<_> = w2.iter().filter_map(|m| m.group_id.clone()).collect();
        assert!(groups.iter().all(|g| g == "g2"), "g1 is still locked by w1: {groups:?}");
        Ok(())
    }

    #[tokio::test]
    async fn extend_locks_skips_foreign_captures() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &options());
        let m1 = msg(-2000);
        let m2 = msg(-1000);
        store.write_batch(vec![m1.clone(), m2.clone()]).await?;

        let captured = store.read_and_capture("w1").await?;
        assert_eq!(captured.len(), 2);

        let later = Utc::now() + Duration::seconds(30);
        let extended = store.extend_locks("w2", &[m1.id, m2.id], later).await?;
        assert_eq!(extended, 0, "w2 owns nothing");

        let extended = store.extend_locks("w1", &[m1.id], later).await?;
        assert_eq!(extended, 1);
        Ok(())
    }

    #[tokio::test]
    async fn process_results_batch_applies_all_four_subsets() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &options());
        let mut msgs: Vec<Message> = (0..4).map(|i| msg(-4000 + i * 100)).collect();
        for m in &mut msgs {
            m.attempts_count = 0;
        }
        store.write_batch(msgs.clone()).await?;
        store.read_and_capture("w1").await?;

        store
            .process_results_batch(ProcessResults {
                complete: vec![msgs[0].id],
                fail: vec![msgs[1].id],
                release: vec![msgs[2].id],
                dead_letter: vec![(msgs[3].id, "rejected".into())],
            })
            .await?;

        let metrics = store.health_metrics().await?;
        assert_eq!(metrics.pending, 2, "failed + released back to pending");
        assert_eq!(metrics.dead_letter, 1);
        assert_eq!(store.message_count(), 2);

        let captured = store.read_and_capture("w2").await?;
        let failed = captured.iter().find(|m| m.id == msgs[1].id).expect("failed message");
        assert_eq!(failed.attempts_count, 1);
        let released = captured.iter().find(|m| m.id == msgs[2].id).expect("released message");
        assert_eq!(released.attempts_count, 0, "release does not bump attempts");
        Ok(())
    }

    #[tokio::test]
    async fn dead_letter_move_is_idempotent() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &options());
        let m = msg(-1000);
        store.write(m.clone()).await?;

        store.move_to_dead_letter_batch(&[(m.id, "first".into())]).await?;
        store.move_to_dead_letter_batch(&[(m.id, "second".into())]).await?;

        let dead = store.read_dead_letters(10).await?;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failure_reason, "first");
        Ok(())
    }

    #[tokio::test]
    async fn requeue_restores_pending_with_reset_attempts() -> anyhow::Result<()> {
        let store = MemoryInboxStore::new("test", &options());
        let mut m = msg(-1000);
        m.attempts_count = 3;
        store.write(m.clone()).await?;
        store.move_to_dead_letter_batch(&[(m.id, "max attempts".into())]).await?;

        let requeued = store.requeue_dead_letters(&[m.id, Uuid::new_v4()]).await?;
        assert_eq!(requeued, 1);

        let captured = store.read_and_capture("w1").await?;
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].attempts_count, 0);
        assert_eq!(store.read_dead_letters(10).await?.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_deletes_are_bounded_by_batch() -> anyhow::Result<()> {
        let opts = InboxOptions {
            enable_deduplication: true,
            ..options()
        };
        let store = MemoryInboxStore::new("test", &opts);
        for i in 0..5 {
            let mut m = msg(-1000 - i);
            m.deduplication_id = Some(format!("d{i}"));
            store.write(m).await?;
        }

        let cutoff = Utc::now() + Duration::seconds(1);
        let first = store.delete_expired_deduplications(cutoff, 3).await?;
        assert_eq!(first, 3);
        let second = store.delete_expired_deduplications(cutoff, 3).await?;
        assert_eq!(second, 2);
        Ok(())
    }
}
