//! A named inbox: storage provider + options + handler dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{InboxError, Result};
use crate::handler::HandlerKind;
use crate::health::{self, HealthReport, HealthThresholds};
use crate::message::DeadLetterMessage;
use crate::options::InboxOptions;
use crate::provider::{StorageHealthMetrics, StorageProvider};
use crate::writer::InboxWriter;

pub(crate) struct InboxShared {
    pub name: String,
    pub options: Arc<InboxOptions>,
    pub provider: Arc<dyn StorageProvider>,
    /// `message_type` → handler, fixed after build.
    pub handlers: HashMap<String, HandlerKind>,
    pub health_thresholds: HealthThresholds,
}

/// Handle to one configured inbox. Cheap to clone; all state lives behind
/// the shared core.
#[derive(Clone)]
pub struct Inbox {
    pub(crate) shared: Arc<InboxShared>,
}

impl Inbox {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &InboxOptions {
        &self.shared.options
    }

    pub fn has_handlers(&self) -> bool {
        !self.shared.handlers.is_empty()
    }

    pub fn writer(&self) -> InboxWriter {
        InboxWriter::new(
            self.shared.name.clone(),
            Arc::clone(&self.shared.options),
            Arc::clone(&self.shared.provider),
        )
    }

    pub async fn health_metrics(&self) -> Result<StorageHealthMetrics> {
        self.shared
            .provider
            .health_metrics()
            .await
            .map_err(InboxError::Storage)
    }

    pub async fn health_report(&self) -> Result<HealthReport> {
        let metrics = self.health_metrics().await?;
        Ok(health::evaluate(
            &metrics,
            &self.shared.health_thresholds,
            Utc::now(),
        ))
    }

    pub async fn read_dead_letters(&self, count: usize) -> Result<Vec<DeadLetterMessage>> {
        self.shared
            .provider
            .read_dead_letters(count)
            .await
            .map_err(InboxError::Storage)
    }

    /// Put dead-lettered messages back in line, attempts reset.
    pub async fn requeue_dead_letters(&self, ids: &[Uuid]) -> Result<u64> {
        self.shared
            .provider
            .requeue_dead_letters(ids)
            .await
            .map_err(InboxError::Storage)
    }

    pub(crate) fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.shared.provider
    }
}
