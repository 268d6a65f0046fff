//! Scenario: FIFO Group Ordering Holds With Competing Workers
//!
//! # Invariant under test
//! Within one FIFO group, handler invocations happen in strictly
//! ascending `received_at` order even when two workers poll the same
//! backing store. The group lock serializes the group; the first
//! non-Success outcome releases the rest of the captured slice so the
//! next cycle resumes at the failed message.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ibx_core::{DeliveryMode, InboxManager, InboxOptions, Outcome};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{wait_until, Recorder, TestEvent};

fn fifo_options() -> InboxOptions {
    InboxOptions {
        delivery_mode: DeliveryMode::Fifo,
        read_batch_size: 4,
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

fn build_worker(
    store: &Arc<MemoryInboxStore>,
    recorder: &Recorder,
) -> anyhow::Result<InboxManager> {
    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), fifo_options())?
        .handle_fifo::<TestEvent, _>(recorder.clone())?;
    Ok(builder.build()?)
}

#[tokio::test]
async fn two_workers_observe_strict_order_within_group() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &fifo_options()));
    let recorder = Recorder::new();

    let worker_a = build_worker(&store, &recorder)?;
    let worker_b = build_worker(&store, &recorder)?;

    for seq in 1..=10 {
        worker_a.write(&ordered_event(seq, "g1")).await?;
    }

    worker_a.start().await?;
    worker_b.start().await?;

    let drained = wait_until(Duration::from_secs(10), || {
        recorder.delivery_count() >= 10 && store.message_count() == 0
    })
    .await;

    worker_a.stop().await?;
    worker_b.stop().await?;
    assert!(drained, "all ten messages should be processed");

    let sequence: Vec<u32> = recorder.deliveries().iter().map(|d| d.seq).collect();
    assert_eq!(sequence, (1..=10).collect::<Vec<u32>>(), "strict FIFO order per group");
    Ok(())
}

#[tokio::test]
async fn first_failure_releases_the_rest_of_the_group_slice() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &fifo_options()));
    let recorder = Recorder::new();
    // seq 1 succeeds, seq 2 fails once, then everything succeeds.
    recorder.script([Outcome::Success, Outcome::Failed]);

    let worker = build_worker(&store, &recorder)?;
    for seq in 1..=4 {
        worker.write(&ordered_event(seq, "g1")).await?;
    }

    worker.start().await?;
    let drained = wait_until(Duration::from_secs(10), || store.message_count() == 0).await;
    worker.stop().await?;
    assert!(drained);

    let sequence: Vec<u32> = recorder.deliveries().iter().map(|d| d.seq).collect();
    assert_eq!(
        sequence,
        vec![1, 2, 2, 3, 4],
        "seq 3 and 4 must wait for seq 2 to succeed on its second attempt"
    );
    Ok(())
}
