//! Scenario: Graceful Drain Releases In-Flight Messages
//!
//! # Invariant under test
//! When a worker is stopped mid-batch, the current handler invocation is
//! allowed to finish within `shutdown_timeout` and every message still in
//! flight is released — observable as an immediate re-capture by a fresh
//! worker rather than a wait for the staleness cutoff.

use std::sync::Arc;
use std::time::Duration;

use ibx_core::{InboxManager, InboxOptions, StorageProvider};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{wait_until, Recorder, TestEvent};

fn options() -> InboxOptions {
    InboxOptions {
        read_batch_size: 10,
        // Long staleness so only an explicit release can make the
        // messages capturable again within the test window.
        max_processing_time: Duration::from_secs(300),
        polling_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn stop_mid_batch_releases_unprocessed_messages() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &options()));
    let recorder = Recorder::new().with_delay(Duration::from_millis(200));

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), options())?
        .handle_single::<TestEvent, _>(recorder.clone())?;
    let manager = builder.build()?;

    for seq in 1..=10 {
        manager.write(&TestEvent::seq(seq)).await?;
    }

    manager.start().await?;
    // Let the worker capture the batch and get at least one message done.
    let started = wait_until(Duration::from_secs(10), || recorder.delivery_count() >= 1).await;
    assert!(started);

    manager.stop().await?;
    let processed = recorder.delivery_count();
    assert!(processed < 10, "stop must interrupt the batch, got {processed}");

    // In-flight messages were released, not left captured: a fresh worker
    // captures all remaining messages immediately.
    let recaptured = store.read_and_capture("fresh-worker").await?;
    assert_eq!(
        recaptured.len() + processed,
        10,
        "every unprocessed message is immediately capturable"
    );
    assert!(recaptured
        .iter()
        .all(|m| m.captured_by.as_deref() == Some("fresh-worker")));
    Ok(())
}
