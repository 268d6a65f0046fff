//! ibx-testkit
//!
//! Shared fixtures for the end-to-end scenario tests: a configurable test
//! message type, handlers that record their invocations, and small async
//! helpers. The scenario tests themselves live under `tests/`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ibx_core::handler::{BatchOutcome, Envelope, HandleBatched, HandleFifoBatched, HandleSingle, Outcome};
use ibx_core::registry::InboxMessage;

/// Test payload. Optional fields drive the write-path trait contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvent {
    pub seq: u32,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub collapse: Option<String>,
    #[serde(default)]
    pub dedup: Option<String>,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

impl TestEvent {
    pub fn seq(seq: u32) -> Self {
        Self {
            seq,
            value: 0,
            group: None,
            collapse: None,
            dedup: None,
            id: None,
            at: None,
        }
    }

    pub fn grouped(seq: u32, group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Self::seq(seq)
        }
    }
}

impl InboxMessage for TestEvent {
    const MESSAGE_TYPE: &'static str = "test-event";

    fn external_id(&self) -> Option<Uuid> {
        self.id
    }

    fn group_id(&self) -> Option<String> {
        self.group.clone()
    }

    fn collapse_key(&self) -> Option<String> {
        self.collapse.clone()
    }

    fn deduplication_id(&self) -> Option<String> {
        self.dedup.clone()
    }

    fn received_at(&self) -> Option<DateTime<Utc>> {
        self.at
    }
}

/// One recorded handler invocation.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub seq: u32,
    pub group: Option<String>,
    pub attempts: i32,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct RecorderState {
    deliveries: Vec<Delivery>,
    scripted: VecDeque<Outcome>,
    delay: Option<Duration>,
}

/// Handler that records every delivery and replays scripted outcomes
/// (falling back to `Success` once the script runs out). Clones share
/// state, so the same recorder can be registered with several workers.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes to return, in order, before defaulting to `Success`.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state
            .lock()
            .expect("recorder lock poisoned")
            .scripted
            .extend(outcomes);
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().expect("recorder lock poisoned").delay = Some(delay);
        self
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state
            .lock()
            .expect("recorder lock poisoned")
            .deliveries
            .clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.state.lock().expect("recorder lock poisoned").deliveries.len()
    }

    fn record(&self, envelope: &Envelope<TestEvent>) -> (Outcome, Option<Duration>) {
        let mut state = self.state.lock().expect("recorder lock poisoned");
        state.deliveries.push(Delivery {
            id: envelope.id,
            seq: envelope.message.seq,
            group: envelope.group_id.clone(),
            attempts: envelope.attempts_count,
            at: Utc::now(),
        });
        let outcome = state.scripted.pop_front().unwrap_or(Outcome::Success);
        (outcome, state.delay)
    }
}

#[async_trait]
impl HandleSingle<TestEvent> for Recorder {
    async fn handle(&self, envelope: Envelope<TestEvent>, _cancel: CancellationToken) -> Outcome {
        let (outcome, delay) = self.record(&envelope);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

#[async_trait]
impl HandleBatched<TestEvent> for Recorder {
    async fn handle(
        &self,
        batch: Vec<Envelope<TestEvent>>,
        _cancel: CancellationToken,
    ) -> Vec<BatchOutcome> {
        let mut delay = None;
        let outcomes = batch
            .iter()
            .map(|envelope| {
                let (outcome, d) = self.record(envelope);
                delay = d;
                BatchOutcome {
                    id: envelope.id,
                    outcome,
                }
            })
            .collect();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcomes
    }
}

#[async_trait]
impl HandleFifoBatched<TestEvent> for Recorder {
    async fn handle(
        &self,
        _group_id: &str,
        batch: Vec<Envelope<TestEvent>>,
        _cancel: CancellationToken,
    ) -> Vec<BatchOutcome> {
        batch
            .iter()
            .map(|envelope| {
                let (outcome, _) = self.record(envelope);
                BatchOutcome {
                    id: envelope.id,
                    outcome,
                }
            })
            .collect()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Options tuned for fast scenario turnaround.
pub fn fast_options() -> ibx_core::InboxOptions {
    ibx_core::InboxOptions {
        polling_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}
