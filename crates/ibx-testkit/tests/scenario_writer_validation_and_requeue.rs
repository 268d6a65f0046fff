//! Scenario: Writer Validation And Dead-Letter Requeue
//!
//! # Invariants under test
//! - A FIFO inbox rejects messages without a group id at write time.
//! - The writer round-trips payloads byte-for-byte through storage.
//! - Requeued dead letters return to the pending set with attempts reset
//!   and flow through processing again.

use std::sync::Arc;
use std::time::Duration;

use ibx_core::{DeliveryMode, InboxError, InboxManager, InboxOptions, Outcome, StorageProvider};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{fast_options, wait_until, Recorder, TestEvent};

#[tokio::test]
async fn fifo_inbox_rejects_messages_without_group_id() -> anyhow::Result<()> {
    let options = InboxOptions {
        delivery_mode: DeliveryMode::Fifo,
        ..fast_options()
    };
    let store = Arc::new(MemoryInboxStore::new("orders", &options));

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options)?
        .message_type::<TestEvent>()?;
    let manager = builder.build()?;

    let err = manager.write(&TestEvent::seq(1)).await.unwrap_err();
    assert!(matches!(err, InboxError::InvalidMessage(_)), "got: {err}");
    assert_eq!(store.message_count(), 0, "nothing was persisted");

    manager.write(&TestEvent::grouped(1, "g1")).await?;
    assert_eq!(store.message_count(), 1);
    Ok(())
}

#[tokio::test]
async fn payload_round_trips_through_storage() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &fast_options()));

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), fast_options())?
        .message_type::<TestEvent>()?;
    let manager = builder.build()?;

    let event = TestEvent {
        value: 42,
        ..TestEvent::seq(7)
    };
    manager.write(&event).await?;

    let captured = store.read_and_capture("w1").await?;
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].payload, serde_json::to_string(&event)?);

    let decoded: TestEvent = serde_json::from_str(&captured[0].payload)?;
    assert_eq!(decoded.seq, 7);
    assert_eq!(decoded.value, 42);
    Ok(())
}

#[tokio::test]
async fn requeued_dead_letters_are_processed_again() -> anyhow::Result<()> {
    let options = InboxOptions {
        max_attempts: 1,
        polling_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let store = Arc::new(MemoryInboxStore::new("orders", &options));
    let recorder = Recorder::new();
    // First delivery fails straight into the dead-letter store
    // (max_attempts = 1); the requeued copy succeeds.
    recorder.script([Outcome::Failed]);

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options)?
        .handle_single::<TestEvent, _>(recorder.clone())?;
    let manager = builder.build()?;

    manager.write(&TestEvent::seq(1)).await?;
    manager.start().await?;

    let dead = wait_until(Duration::from_secs(10), || store.message_count() == 0).await;
    assert!(dead);
    let dead_letters = manager.inbox("orders")?.read_dead_letters(10).await?;
    assert_eq!(dead_letters.len(), 1);

    let requeued = manager
        .inbox("orders")?
        .requeue_dead_letters(&[dead_letters[0].id])
        .await?;
    assert_eq!(requeued, 1);

    let processed = wait_until(Duration::from_secs(10), || {
        recorder.delivery_count() >= 2 && store.message_count() == 0
    })
    .await;
    manager.stop().await?;
    assert!(processed, "requeued message flows through processing again");

    let second = &recorder.deliveries()[1];
    assert_eq!(second.attempts, 0, "requeue resets the attempt counter");
    assert_eq!(manager.inbox("orders")?.read_dead_letters(10).await?.len(), 0);
    Ok(())
}
