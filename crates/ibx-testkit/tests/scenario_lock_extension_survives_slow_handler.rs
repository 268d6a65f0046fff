//! Scenario: Lock Extension Outlives A Slow Handler
//!
//! # Invariant under test
//! With lock extension enabled, a handler that runs longer than
//! `max_processing_time` keeps its capture lease fresh, so a competing
//! worker never re-captures the message and the outcome commits exactly
//! once.

use std::sync::Arc;
use std::time::Duration;

use ibx_core::{InboxManager, InboxOptions};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{wait_until, Recorder, TestEvent};

fn options() -> InboxOptions {
    InboxOptions {
        max_processing_time: Duration::from_millis(300),
        enable_lock_extension: true,
        lock_extension_threshold: 0.5,
        polling_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn slow_handler_completes_without_recapture() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &options()));
    // The handler takes four staleness windows to finish.
    let recorder = Recorder::new().with_delay(Duration::from_millis(1200));

    let mut builder_a = InboxManager::builder();
    builder_a
        .add_inbox("orders", store.clone(), options())?
        .handle_single::<TestEvent, _>(recorder.clone())?;
    let worker_a = builder_a.build()?;

    let mut builder_b = InboxManager::builder();
    builder_b
        .add_inbox("orders", store.clone(), options())?
        .handle_single::<TestEvent, _>(recorder.clone())?;
    let worker_b = builder_b.build()?;

    worker_a.write(&TestEvent::seq(1)).await?;
    worker_a.start().await?;
    worker_b.start().await?;

    let completed = wait_until(Duration::from_secs(10), || store.message_count() == 0).await;
    worker_a.stop().await?;
    worker_b.stop().await?;
    assert!(completed, "message should complete");

    assert_eq!(
        recorder.delivery_count(),
        1,
        "the competing worker must never observe the message as stale"
    );
    Ok(())
}
