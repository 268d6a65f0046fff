//! Scenario: Manager Start/Stop Is Idempotent And Hook Failures Roll Back
//!
//! # Invariants under test
//! - `start` and `stop` may be called repeatedly without effect.
//! - A lifecycle hook failing in `on_start` aborts the start: loops are
//!   stopped, the error surfaces, and the manager stays not-running.
//! - Configuration errors (duplicate inbox, handler/mode mismatch, invalid
//!   name, invalid options) surface at build/register time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ibx_core::manager::LifecycleHook;
use ibx_core::{DeliveryMode, InboxManager, InboxOptions};
use ibx_memory::MemoryInboxStore;
use ibx_testkit::{fast_options, wait_until, Recorder, TestEvent};
use tokio_util::sync::CancellationToken;

struct CountingHook {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: bool,
}

impl CountingHook {
    fn new(fail_start: bool) -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start,
        })
    }
}

#[async_trait]
impl LifecycleHook for CountingHook {
    fn name(&self) -> String {
        "counting-hook".into()
    }

    async fn on_start(self: Arc<Self>, _stopping: CancellationToken) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            anyhow::bail!("refusing to start");
        }
        Ok(())
    }

    async fn on_stop(self: Arc<Self>) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn start_and_stop_are_idempotent() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &fast_options()));
    let recorder = Recorder::new();
    let hook = CountingHook::new(false);

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), fast_options())?
        .handle_single::<TestEvent, _>(recorder.clone())?;
    builder.add_hook(hook.clone());
    let manager = builder.build()?;

    manager.start().await?;
    manager.start().await?;
    assert_eq!(hook.starts.load(Ordering::SeqCst), 1, "second start is a no-op");

    // The loop is actually alive.
    manager.write(&TestEvent::seq(1)).await?;
    assert!(wait_until(Duration::from_secs(10), || recorder.delivery_count() == 1).await);

    manager.stop().await?;
    manager.stop().await?;
    assert_eq!(hook.stops.load(Ordering::SeqCst), 1, "second stop is a no-op");
    Ok(())
}

#[tokio::test]
async fn failing_hook_rolls_back_the_start() -> anyhow::Result<()> {
    let store = Arc::new(MemoryInboxStore::new("orders", &fast_options()));
    let recorder = Recorder::new();
    let hook = CountingHook::new(true);

    let mut builder = InboxManager::builder();
    builder
        .add_inbox("orders", store.clone(), fast_options())?
        .handle_single::<TestEvent, _>(recorder.clone())?;
    builder.add_hook(hook.clone());
    let manager = builder.build()?;

    assert!(manager.start().await.is_err(), "hook failure must surface");
    assert_eq!(hook.stops.load(Ordering::SeqCst), 1, "rollback stops the hooks");

    // The rollback stopped the loops: nothing processes this write.
    manager.write(&TestEvent::seq(1)).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.delivery_count(), 0);
    Ok(())
}

#[tokio::test]
async fn configuration_errors_surface_at_build_time() {
    let store = Arc::new(MemoryInboxStore::new("orders", &fast_options()));

    // Duplicate inbox name.
    let mut builder = InboxManager::builder();
    builder.add_inbox("orders", store.clone(), fast_options()).unwrap();
    assert!(builder.add_inbox("orders", store.clone(), fast_options()).is_err());

    // Invalid inbox name.
    let mut builder = InboxManager::builder();
    assert!(builder.add_inbox("orders!", store.clone(), fast_options()).is_err());

    // Handler shape must match the delivery mode.
    let mut builder = InboxManager::builder();
    let config = builder
        .add_inbox(
            "fifo-orders",
            store.clone(),
            InboxOptions {
                delivery_mode: DeliveryMode::Fifo,
                ..fast_options()
            },
        )
        .unwrap();
    assert!(config.handle_single::<TestEvent, _>(Recorder::new()).is_err());

    // Invalid options.
    let mut builder = InboxManager::builder();
    assert!(builder
        .add_inbox(
            "orders2",
            store,
            InboxOptions {
                max_attempts: 0,
                ..fast_options()
            },
        )
        .is_err());
}
