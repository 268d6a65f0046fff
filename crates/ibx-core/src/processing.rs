//! The per-inbox processing loop and its batch context.
//!
//! Cycle: poll → capture → dispatch to the delivery strategy → commit the
//! accumulated results in one batch → release whatever is still in flight.
//! Lock extension runs as a side task while a batch is being processed;
//! drain on shutdown is bounded by `shutdown_timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::handler::Outcome;
use crate::inbox::InboxShared;
use crate::message::Message;
use crate::provider::ProcessResults;
use crate::strategies::DeliveryStrategy;

/// Dead-letter reason for a message that ran out of attempts.
pub(crate) fn max_attempts_reason(max_attempts: i32) -> String {
    format!("Max attempts ({max_attempts}) exceeded")
}

/// Dead-letter reason for an undecodable payload.
pub(crate) fn deserialize_reason(detail: &str) -> String {
    format!("Failed to deserialize message payload: {detail}")
}

pub(crate) const HANDLER_DEAD_LETTER_REASON: &str = "Handler requested move to dead letter";

/// Tracks one captured batch: which messages are still in flight and the
/// outcomes recorded so far. Strategies report through [`record`]; the loop
/// commits and releases the rest.
pub(crate) struct ProcessingContext {
    shared: Arc<InboxShared>,
    in_flight: Mutex<HashMap<Uuid, Message>>,
    results: Mutex<ProcessResults>,
}

impl ProcessingContext {
    pub(crate) fn new(shared: Arc<InboxShared>, batch: &[Message]) -> Arc<Self> {
        let in_flight = batch.iter().map(|m| (m.id, m.clone())).collect();
        Arc::new(Self {
            shared,
            in_flight: Mutex::new(in_flight),
            results: Mutex::new(ProcessResults::default()),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<InboxShared> {
        &self.shared
    }

    /// Report a handler outcome for one message, applying the max-attempts
    /// policy. The message leaves the in-flight set.
    pub(crate) fn record(&self, id: Uuid, outcome: Outcome) {
        let options = &self.shared.options;
        let taken = self.in_flight.lock().expect("in-flight lock poisoned").remove(&id);
        let Some(message) = taken else {
            warn!(inbox = %self.shared.name, message_id = %id, "outcome reported for unknown message");
            return;
        };

        let mut results = self.results.lock().expect("results lock poisoned");
        match outcome {
            Outcome::Success => results.complete.push(id),
            Outcome::Retry => results.release.push(id),
            Outcome::Failed => {
                if message.attempts_count + 1 >= options.max_attempts {
                    self.push_dead_letter(&mut results, id, max_attempts_reason(options.max_attempts));
                } else {
                    results.fail.push(id);
                }
            }
            Outcome::MoveToDeadLetter { reason } => {
                let reason = reason.unwrap_or_else(|| HANDLER_DEAD_LETTER_REASON.to_string());
                self.push_dead_letter(&mut results, id, reason);
            }
        }
    }

    /// Dead-letter with an explicit reason (deserialization failures).
    pub(crate) fn record_dead_letter(&self, id: Uuid, reason: String) {
        let taken = self.in_flight.lock().expect("in-flight lock poisoned").remove(&id);
        if taken.is_none() {
            warn!(inbox = %self.shared.name, message_id = %id, "dead-letter reported for unknown message");
            return;
        }
        let mut results = self.results.lock().expect("results lock poisoned");
        self.push_dead_letter(&mut results, id, reason);
    }

    fn push_dead_letter(&self, results: &mut ProcessResults, id: Uuid, reason: String) {
        if self.shared.options.enable_dead_letter {
            results.dead_letter.push((id, reason));
        } else {
            // With dead-lettering off there is no terminal store; dropping
            // the message is the only way to stop it from looping.
            error!(
                inbox = %self.shared.name,
                message_id = %id,
                reason = %reason,
                "dead-lettering disabled; completing message instead"
            );
            results.complete.push(id);
        }
    }

    pub(crate) fn in_flight_ids(&self) -> Vec<Uuid> {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub(crate) fn take_in_flight(&self) -> Vec<Message> {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .drain()
            .map(|(_, m)| m)
            .collect()
    }

    /// Refresh in-memory capture state after a successful lock extension.
    pub(crate) fn mark_extended(&self, ids: &[Uuid], captured_at: DateTime<Utc>, processor_id: &str) {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        for id in ids {
            if let Some(message) = in_flight.get_mut(id) {
                message.captured_at = Some(captured_at);
                message.captured_by = Some(processor_id.to_string());
            }
        }
    }

    /// Commit all recorded outcomes in one provider round-trip.
    pub(crate) async fn commit(&self) -> anyhow::Result<()> {
        let results = std::mem::take(&mut *self.results.lock().expect("results lock poisoned"));
        if results.is_empty() {
            return Ok(());
        }
        debug!(
            inbox = %self.shared.name,
            complete = results.complete.len(),
            fail = results.fail.len(),
            release = results.release.len(),
            dead_letter = results.dead_letter.len(),
            "committing batch results"
        );
        self.shared.provider.process_results_batch(results).await
    }
}

/// Long-lived poller for one inbox in this process.
pub(crate) struct ProcessingLoop {
    shared: Arc<InboxShared>,
    strategy: Arc<dyn DeliveryStrategy>,
    processor_id: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Worker identity: hostname plus a random suffix, unique per loop.
pub(crate) fn processor_id() -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{hostname}-{:08x}", rand::random::<u32>())
}

impl ProcessingLoop {
    pub(crate) fn new(
        shared: Arc<InboxShared>,
        strategy: Arc<dyn DeliveryStrategy>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            strategy,
            processor_id: processor_id(),
            cancel,
            handle: Mutex::new(None),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    /// Cancel and wait for the loop to drain. The loop itself bounds the
    /// drain by `shutdown_timeout`; if it still does not return the task is
    /// aborted and captured messages recover via staleness.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            let grace = self.shared.options.shutdown_timeout + Duration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(inbox = %self.shared.name, "processing loop did not stop in time; aborting");
                abort.abort();
            }
        }
    }

    async fn run(self: Arc<Self>) {
        info!(
            inbox = %self.shared.name,
            processor_id = %self.processor_id,
            "processing loop started"
        );

        let read_delay = self.shared.options.read_delay;
        let mut last_cycle_start: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Cycle cadence is bounded below by read_delay, measured from
            // the previous cycle start.
            if let Some(prev) = last_cycle_start {
                if !read_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep_until(prev + read_delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
            last_cycle_start = Some(Instant::now());

            let batch = tokio::select! {
                res = self.shared.provider.read_and_capture(&self.processor_id) => match res {
                    Ok(batch) => batch,
                    Err(err) => {
                        error!(inbox = %self.shared.name, error = %format!("{err:#}"), "capture failed");
                        if !self.sleep_polling_interval().await {
                            break;
                        }
                        continue;
                    }
                },
                _ = self.cancel.cancelled() => break,
            };

            if batch.is_empty() {
                if !self.sleep_polling_interval().await {
                    break;
                }
                continue;
            }

            debug!(inbox = %self.shared.name, captured = batch.len(), "captured batch");
            self.process_batch(batch).await;
        }

        info!(inbox = %self.shared.name, processor_id = %self.processor_id, "processing loop stopped");
    }

    /// `false` when cancelled during the wait.
    async fn sleep_polling_interval(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.shared.options.polling_interval) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn process_batch(&self, batch: Vec<Message>) {
        let options = &self.shared.options;
        let ctx = ProcessingContext::new(Arc::clone(&self.shared), &batch);

        let extender = if options.enable_lock_extension {
            Some(self.spawn_lock_extender(Arc::clone(&ctx)))
        } else {
            None
        };

        let deliver = self.strategy.deliver(&ctx, batch, &self.cancel);
        tokio::pin!(deliver);

        let releasable_groups = tokio::select! {
            groups = &mut deliver => groups,
            _ = self.cancel.cancelled() => {
                // Drain: give the in-progress invocation a bounded window.
                match tokio::time::timeout(options.shutdown_timeout, &mut deliver).await {
                    Ok(groups) => groups,
                    Err(_) => {
                        warn!(
                            inbox = %self.shared.name,
                            "strategy did not finish within shutdown_timeout; releasing in-flight messages"
                        );
                        Vec::new()
                    }
                }
            }
        };

        if let Some(guard) = extender {
            guard.cancel();
        }

        if let Err(err) = ctx.commit().await {
            // Outcomes are lost; captured rows recover via the staleness
            // cutoff. Releasing anything here could let a FIFO group run
            // ahead of its uncommitted predecessors.
            error!(inbox = %self.shared.name, error = %format!("{err:#}"), "result commit failed");
            return;
        }

        self.release_remaining(&ctx).await;

        if !releasable_groups.is_empty() {
            if let Err(err) = self
                .shared
                .provider
                .release_group_locks(&releasable_groups)
                .await
            {
                warn!(
                    inbox = %self.shared.name,
                    error = %format!("{err:#}"),
                    "group lock release failed; locks expire via TTL"
                );
            }
        }
    }

    /// Release whatever the strategy never reported, so another worker (or
    /// this one after restart) picks the messages up immediately instead of
    /// waiting out the staleness cutoff.
    async fn release_remaining(&self, ctx: &ProcessingContext) {
        let remaining = ctx.take_in_flight();
        if remaining.is_empty() {
            return;
        }

        info!(
            inbox = %self.shared.name,
            count = remaining.len(),
            "releasing in-flight messages"
        );

        let provider = Arc::clone(&self.shared.provider);
        let fifo = self.shared.options.delivery_mode.is_fifo();
        let release = async {
            if fifo {
                provider.release_messages_and_group_locks(&remaining).await
            } else {
                let ids: Vec<Uuid> = remaining.iter().map(|m| m.id).collect();
                provider.release_batch(&ids).await
            }
        };

        match tokio::time::timeout(self.shared.options.shutdown_timeout, release).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                inbox = %self.shared.name,
                error = %format!("{err:#}"),
                "in-flight release failed; messages recover via staleness"
            ),
            Err(_) => warn!(
                inbox = %self.shared.name,
                "in-flight release timed out; messages recover via staleness"
            ),
        }
    }

    /// Periodic lock extension while a batch is in flight. Failure is
    /// logged, never fatal — the worst case is a stale re-capture elsewhere.
    fn spawn_lock_extender(&self, ctx: Arc<ProcessingContext>) -> CancellationToken {
        let guard = CancellationToken::new();
        let task_guard = guard.clone();
        let interval = self.shared.options.lock_extension_interval();
        let processor_id = self.processor_id.clone();
        let provider = Arc::clone(&self.shared.provider);
        let inbox = self.shared.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = task_guard.cancelled() => break,
                }

                let ids = ctx.in_flight_ids();
                if ids.is_empty() {
                    continue;
                }

                let now = Utc::now();
                match provider.extend_locks(&processor_id, &ids, now).await {
                    Ok(extended) => {
                        debug!(inbox = %inbox, requested = ids.len(), extended, "extended capture locks");
                        ctx.mark_extended(&ids, now, &processor_id);
                    }
                    Err(err) => {
                        warn!(inbox = %inbox, error = %format!("{err:#}"), "lock extension failed");
                    }
                }
            }
        });

        guard
    }
}
