//! Background cleanup of expired dedup records, group locks, and
//! dead-letter rows.
//!
//! One task per concern per inbox, registered as lifecycle hooks so they
//! start and stop with the manager. Deletes are batched to keep
//! transactions short.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::LifecycleHook;
use crate::options::InboxOptions;
use crate::provider::StorageProvider;

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Sleep between cleanup passes in continuous mode.
    pub interval: Duration,
    /// Sleep before resuming after a failed pass.
    pub restart_delay: Duration,
    /// Rows deleted per provider call.
    pub batch_size: u32,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            restart_delay: Duration::from_secs(30),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    ExpiredDeduplications,
    ExpiredGroupLocks,
    ExpiredDeadLetters,
}

impl CleanupKind {
    fn label(&self) -> &'static str {
        match self {
            CleanupKind::ExpiredDeduplications => "expired-deduplications",
            CleanupKind::ExpiredGroupLocks => "expired-group-locks",
            CleanupKind::ExpiredDeadLetters => "expired-dead-letters",
        }
    }
}

/// One cleanup concern for one inbox. Runs continuously under the manager
/// lifecycle, or once to completion via [`run_once`](CleanupTask::run_once)
/// for cron-style execution.
pub struct CleanupTask {
    inbox_name: String,
    kind: CleanupKind,
    provider: Arc<dyn StorageProvider>,
    inbox_options: Arc<InboxOptions>,
    options: CleanupOptions,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupTask {
    pub fn new(
        inbox_name: String,
        kind: CleanupKind,
        provider: Arc<dyn StorageProvider>,
        inbox_options: Arc<InboxOptions>,
        options: CleanupOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            inbox_name,
            kind,
            provider,
            inbox_options,
            options,
            handle: Mutex::new(None),
        })
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.kind {
            CleanupKind::ExpiredDeduplications => {
                now - self.inbox_options.deduplication_interval_chrono()
            }
            // Twice the processing time leaves a safety margin beyond the
            // staleness cutoff before a lock row is considered garbage.
            CleanupKind::ExpiredGroupLocks => {
                now - self.inbox_options.max_processing_time_chrono()
                    - self.inbox_options.max_processing_time_chrono()
            }
            CleanupKind::ExpiredDeadLetters => {
                let lifetime =
                    chrono::Duration::from_std(self.inbox_options.dead_letter_max_message_lifetime)
                        .unwrap_or_else(|_| chrono::Duration::max_value());
                now - lifetime
            }
        }
    }

    /// Delete until a pass comes back short of the batch size, then return
    /// the total deleted. Intended for cron/job execution.
    pub async fn run_once(&self) -> anyhow::Result<u64> {
        let cutoff = self.cutoff(Utc::now());
        let batch = self.options.batch_size;
        let mut total = 0u64;

        loop {
            let deleted = match self.kind {
                CleanupKind::ExpiredDeduplications => {
                    self.provider.delete_expired_deduplications(cutoff, batch).await?
                }
                CleanupKind::ExpiredGroupLocks => {
                    self.provider.delete_expired_group_locks(cutoff, batch).await?
                }
                CleanupKind::ExpiredDeadLetters => {
                    self.provider.delete_expired_dead_letters(cutoff, batch).await?
                }
            };
            total += deleted;
            if deleted < u64::from(batch) {
                break;
            }
        }

        if total > 0 {
            debug!(
                inbox = %self.inbox_name,
                task = self.kind.label(),
                deleted = total,
                "cleanup pass removed rows"
            );
        }
        Ok(total)
    }

    async fn run_continuous(self: Arc<Self>, stopping: CancellationToken) {
        info!(inbox = %self.inbox_name, task = self.kind.label(), "cleanup task started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.options.interval) => {}
                _ = stopping.cancelled() => break,
            }

            if let Err(err) = self.run_once().await {
                warn!(
                    inbox = %self.inbox_name,
                    task = self.kind.label(),
                    error = %format!("{err:#}"),
                    "cleanup pass failed; backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.options.restart_delay) => {}
                    _ = stopping.cancelled() => break,
                }
            }
        }
        info!(inbox = %self.inbox_name, task = self.kind.label(), "cleanup task stopped");
    }
}

#[async_trait]
impl LifecycleHook for CleanupTask {
    fn name(&self) -> String {
        format!("cleanup:{}:{}", self.inbox_name, self.kind.label())
    }

    async fn on_start(self: Arc<Self>, stopping: CancellationToken) -> anyhow::Result<()> {
        let task = Arc::clone(&self);
        let handle = tokio::spawn(task.run_continuous(stopping));
        *self.handle.lock().expect("handle lock poisoned") = Some(handle);
        Ok(())
    }

    async fn on_stop(self: Arc<Self>) -> anyhow::Result<()> {
        // The stopping token already fired; just make sure the task winds
        // down instead of outliving the manager.
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(
                    inbox = %self.inbox_name,
                    task = self.kind.label(),
                    "cleanup task did not stop in time; aborting"
                );
                abort.abort();
            }
        }
        Ok(())
    }
}
