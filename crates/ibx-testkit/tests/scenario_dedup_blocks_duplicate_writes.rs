//! Scenario: Deduplication Blocks Duplicate Writes Inside The Window
//!
//! # Invariant under test
//! With deduplication enabled, two writes sharing a `deduplication_id`
//! within the deduplication interval persist exactly one message — the
//! first one. The second write is silently dropped.

use std::sync::Arc;
use std::time::Duration;

use ibx_core::{InboxManager, InboxOptions, StorageProvider};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::TestEvent;

fn options() -> InboxOptions {
    InboxOptions {
        enable_deduplication: true,
        deduplication_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn deduped(value: i64) -> TestEvent {
    TestEvent {
        value,
        dedup: Some("x".into()),
        ..TestEvent::seq(value as u32)
    }
}

#[tokio::test]
async fn first_write_wins_within_the_window() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &options()));

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options())?
        .message_type::<TestEvent>()?;
    let manager = builder.build()?;

    manager.write(&deduped(1)).await?;
    manager.write(&deduped(2)).await?;

    let captured = store.read_and_capture("w1").await?;
    assert_eq!(captured.len(), 1, "exactly one message persisted");
    let payload: TestEvent = serde_json::from_str(&captured[0].payload)?;
    assert_eq!(payload.value, 1, "the first write wins");

    let metrics = store.health_metrics().await?;
    assert_eq!(metrics.pending, 0);
    Ok(())
}

#[tokio::test]
async fn intra_batch_duplicates_keep_the_last_occurrence() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &options()));

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options())?
        .message_type::<TestEvent>()?;
    let manager = builder.build()?;

    // Within one batch the writer keeps only the last occurrence, so the
    // storage-level guard never sees the earlier duplicate.
    manager.write_batch(&[deduped(1), deduped(2)]).await?;

    let captured = store.read_and_capture("w1").await?;
    assert_eq!(captured.len(), 1);
    let payload: TestEvent = serde_json::from_str(&captured[0].payload)?;
    assert_eq!(payload.value, 2);
    Ok(())
}
