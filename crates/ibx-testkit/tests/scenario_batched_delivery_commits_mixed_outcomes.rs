//! Scenario: Batched Delivery Partitions Mixed Outcomes Into One Commit
//!
//! # Invariant under test
//! The Batched strategy hands the whole per-type slice to the handler and
//! commits the returned outcome list as a single batch: successes are
//! completed, failures retried until exhausted, retries released without
//! an attempt bump, and dead-letter requests honored with their reason.

use std::sync::Arc;
use std::time::Duration;

use ibx_core::{DeliveryMode, InboxManager, InboxOptions, Outcome};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{wait_until, Recorder, TestEvent};

fn options() -> InboxOptions {
    InboxOptions {
        delivery_mode: DeliveryMode::Batched,
        read_batch_size: 10,
        max_attempts: 3,
        polling_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn mixed_outcomes_settle_into_completions_and_one_dead_letter() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &options()));
    let recorder = Recorder::new();
    // First slice: success, fail, retry, dead-letter. Later deliveries of
    // the failed and retried messages succeed.
    recorder.script([
        Outcome::Success,
        Outcome::Failed,
        Outcome::Retry,
        Outcome::dead_letter("rejected by batch handler"),
    ]);

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options())?
        .handle_batched::<TestEvent, _>(recorder.clone())?;
    let manager = builder.build()?;

    // Distinct received_at so the first slice arrives in seq order and
    // lines up with the scripted outcomes.
    let events: Vec<TestEvent> = (1..=4)
        .map(|seq| TestEvent {
            at: Some(chrono::Utc::now() + chrono::Duration::milliseconds(i64::from(seq))),
            ..TestEvent::seq(seq)
        })
        .collect();
    manager.write_batch(&events).await?;

    manager.start().await?;
    let settled = wait_until(Duration::from_secs(10), || store.message_count() == 0).await;
    manager.stop().await?;
    assert!(settled, "all messages should reach a terminal state");

    let dead = manager.inbox("orders")?.read_dead_letters(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_reason, "rejected by batch handler");

    // The retried message came back with no attempt bump; the failed one
    // carried attempts_count = 1 on redelivery.
    let redeliveries: Vec<_> = recorder
        .deliveries()
        .into_iter()
        .filter(|d| d.seq == 2 || d.seq == 3)
        .collect();
    let failed_redelivery = redeliveries.iter().find(|d| d.seq == 2 && d.attempts == 1);
    assert!(failed_redelivery.is_some(), "Failed bumps attempts before redelivery");
    let retried_redelivery = redeliveries.iter().find(|d| d.seq == 3 && d.attempts == 0);
    assert!(retried_redelivery.is_some(), "Retry releases without an attempt bump");
    Ok(())
}
