//! The writer path: payload assembly, intra-batch collapse/dedup, and
//! chunked parallel persistence.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

use crate::codec;
use crate::error::{InboxError, Result};
use crate::message::Message;
use crate::options::InboxOptions;
use crate::provider::StorageProvider;
use crate::registry::InboxMessage;

/// Writes messages into one inbox's backing store.
#[derive(Clone)]
pub struct InboxWriter {
    inbox_name: String,
    options: Arc<InboxOptions>,
    provider: Arc<dyn StorageProvider>,
}

impl InboxWriter {
    pub(crate) fn new(
        inbox_name: String,
        options: Arc<InboxOptions>,
        provider: Arc<dyn StorageProvider>,
    ) -> Self {
        Self {
            inbox_name,
            options,
            provider,
        }
    }

    /// Assemble one persisted message from a payload value.
    pub(crate) fn build_message<T: InboxMessage>(&self, value: &T) -> Result<Message> {
        let group_id = value.group_id();
        match &group_id {
            Some(g) if g.is_empty() => {
                return Err(InboxError::InvalidMessage(format!(
                    "message type '{}' supplied an empty group id",
                    T::MESSAGE_TYPE
                )));
            }
            None if self.options.delivery_mode.is_fifo() => {
                return Err(InboxError::InvalidMessage(format!(
                    "inbox '{}' delivers FIFO; message type '{}' must supply a group id",
                    self.inbox_name,
                    T::MESSAGE_TYPE
                )));
            }
            _ => {}
        }

        Ok(Message {
            id: value.external_id().unwrap_or_else(Uuid::new_v4),
            inbox_name: self.inbox_name.clone(),
            message_type: T::MESSAGE_TYPE.to_string(),
            payload: codec::encode(value)?,
            group_id,
            collapse_key: value.collapse_key(),
            deduplication_id: value.deduplication_id(),
            attempts_count: 0,
            received_at: value.received_at().unwrap_or_else(Utc::now),
            captured_at: None,
            captured_by: None,
        })
    }

    pub async fn write<T: InboxMessage>(&self, value: &T) -> Result<()> {
        let message = self.build_message(value)?;
        self.provider
            .write(message)
            .await
            .map_err(InboxError::Storage)
    }

    /// Write a batch. An empty batch is a silent no-op.
    pub async fn write_batch<T: InboxMessage>(&self, values: &[T]) -> Result<()> {
        let mut batch = Vec::with_capacity(values.len());
        for value in values {
            batch.push(self.build_message(value)?);
        }
        self.write_messages(batch).await
    }

    /// Write pre-assembled messages: collapse within the batch, then chunk
    /// and persist.
    pub async fn write_messages(&self, batch: Vec<Message>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let batch = collapse_batch(batch);
        let chunk_size = self.options.write_batch_size;
        let mut chunks: Vec<Vec<Message>> = Vec::new();
        let mut current = Vec::with_capacity(chunk_size.min(batch.len()));
        for message in batch {
            current.push(message);
            if current.len() == chunk_size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        if chunks.len() > 1 && self.options.max_write_threads > 1 {
            self.write_chunks_parallel(chunks).await
        } else {
            for chunk in chunks {
                self.provider
                    .write_batch(chunk)
                    .await
                    .map_err(InboxError::Storage)?;
            }
            Ok(())
        }
    }

    async fn write_chunks_parallel(&self, chunks: Vec<Vec<Message>>) -> Result<()> {
        debug!(
            inbox = %self.inbox_name,
            chunks = chunks.len(),
            threads = self.options.max_write_threads,
            "dispatching write chunks in parallel"
        );

        let mut set = JoinSet::new();
        let mut pending = chunks.into_iter();
        let mut first_error: Option<InboxError> = None;

        for chunk in pending.by_ref().take(self.options.max_write_threads) {
            let provider = Arc::clone(&self.provider);
            set.spawn(async move { provider.write_batch(chunk).await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(InboxError::Storage(err));
                }
                Err(err) => {
                    first_error
                        .get_or_insert(InboxError::Storage(anyhow::anyhow!("write task failed: {err}")));
                }
            }
            // Keep the pipeline full until all chunks are dispatched.
            if first_error.is_none() {
                if let Some(chunk) = pending.next() {
                    let provider = Arc::clone(&self.provider);
                    set.spawn(async move { provider.write_batch(chunk).await });
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Drop earlier duplicates within one batch, keeping only the last
/// occurrence per `collapse_key` and per `deduplication_id`. Without this
/// pass the store would insert the earlier version only for the later one
/// to delete it moments later.
pub(crate) fn collapse_batch(batch: Vec<Message>) -> Vec<Message> {
    let mut seen_collapse: HashSet<String> = HashSet::new();
    let mut seen_dedup: HashSet<String> = HashSet::new();
    let mut kept: Vec<Message> = Vec::with_capacity(batch.len());

    for message in batch.into_iter().rev() {
        if let Some(key) = &message.collapse_key {
            if !seen_collapse.insert(key.clone()) {
                continue;
            }
        }
        if let Some(id) = &message.deduplication_id {
            if !seen_dedup.insert(id.clone()) {
                continue;
            }
        }
        kept.push(message);
    }

    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: i64, collapse_key: Option<&str>, dedup: Option<&str>) -> Message {
        Message {
            id: Uuid::new_v4(),
            inbox_name: "orders".into(),
            message_type: "order".into(),
            payload: format!("{{\"seq\":{seq}}}"),
            group_id: None,
            collapse_key: collapse_key.map(str::to_string),
            deduplication_id: dedup.map(str::to_string),
            attempts_count: 0,
            received_at: Utc::now(),
            captured_at: None,
            captured_by: None,
        }
    }

    #[test]
    fn collapse_keeps_last_occurrence_per_key() {
        let batch = vec![
            msg(1, Some("k"), None),
            msg(2, None, None),
            msg(3, Some("k"), None),
        ];
        let kept = collapse_batch(batch);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].payload, "{\"seq\":2}");
        assert_eq!(kept[1].payload, "{\"seq\":3}");
    }

    #[test]
    fn dedup_ids_deduplicated_within_batch() {
        let batch = vec![
            msg(1, None, Some("x")),
            msg(2, None, Some("x")),
            msg(3, None, Some("y")),
        ];
        let kept = collapse_batch(batch);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].payload, "{\"seq\":2}");
        assert_eq!(kept[1].payload, "{\"seq\":3}");
    }

    #[test]
    fn unkeyed_messages_pass_through_in_order() {
        let batch = vec![msg(1, None, None), msg(2, None, None)];
        let kept = collapse_batch(batch);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].payload, "{\"seq\":1}");
    }
}
