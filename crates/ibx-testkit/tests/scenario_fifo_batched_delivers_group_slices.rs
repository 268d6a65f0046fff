//! Scenario: FIFO-Batched Delivery Hands Ordered Per-Group Slices
//!
//! # Invariant under test
//! The FifoBatched strategy delivers each group's messages as ordered
//! slices without ever reordering the group, and distinct groups settle
//! independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ibx_core::{DeliveryMode, InboxManager, InboxOptions};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{wait_until, Recorder, TestEvent};

fn options() -> InboxOptions {
    InboxOptions {
        delivery_mode: DeliveryMode::FifoBatched,
        read_batch_size: 20,
        max_processing_threads: 2,
        polling_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn ordered_event(seq: u32, group: &str) -> TestEvent {
    TestEvent {
        at: Some(Utc::now() + chrono::Duration::milliseconds(i64::from(seq))),
        ..TestEvent::grouped(seq, group)
    }
}

#[tokio::test]
async fn per_group_slices_preserve_order_across_concurrent_groups() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &options()));
    let recorder = Recorder::new();

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options())?
        .handle_fifo_batched::<TestEvent, _>(recorder.clone())?;
    let manager = builder.build()?;

    for seq in 1..=5 {
        manager.write(&ordered_event(seq, "g1")).await?;
        manager.write(&ordered_event(seq + 100, "g2")).await?;
    }

    manager.start().await?;
    let drained = wait_until(Duration::from_secs(10), || {
        recorder.delivery_count() >= 10 && store.message_count() == 0
    })
    .await;
    manager.stop().await?;
    assert!(drained);

    let deliveries = recorder.deliveries();
    let g1: Vec<u32> = deliveries
        .iter()
        .filter(|d| d.group.as_deref() == Some("g1"))
        .map(|d| d.seq)
        .collect();
    let g2: Vec<u32> = deliveries
        .iter()
        .filter(|d| d.group.as_deref() == Some("g2"))
        .map(|d| d.seq)
        .collect();

    assert_eq!(g1, vec![1, 2, 3, 4, 5], "group g1 delivered in order");
    assert_eq!(g2, vec![101, 102, 103, 104, 105], "group g2 delivered in order");

    assert_eq!(store.group_lock_count(), 0, "fully settled groups drop their locks");
    Ok(())
}
