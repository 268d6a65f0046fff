//! ibx-postgres
//!
//! Relational storage provider on PostgreSQL via sqlx.
//!
//! Four tables per inbox (messages, dead letters, deduplications, group
//! locks) with names derived from the inbox name. Capture uses the
//! `FOR UPDATE SKIP LOCKED` idiom so competing workers never block on each
//! other's claim transactions; the FIFO variant acquires group locks with an
//! insert-or-overwrite-if-stale upsert in the same statement, so two
//! workers can never hold a live lock on the same group.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use ibx_core::message::{DeadLetterMessage, Message};
use ibx_core::options::InboxOptions;
use ibx_core::provider::{ProcessResults, StorageHealthMetrics, StorageProvider};
use ibx_core::retry::ErrorClassifier;

pub const ENV_DB_URL: &str = "IBX_DATABASE_URL";

/// PostgreSQL identifier length cap.
const MAX_IDENTIFIER_LEN: usize = 63;

const MESSAGE_COLUMNS: &str =
    "id, message_type, payload, group_id, collapse_key, deduplication_id, \
     attempts_count, received_at, captured_at, captured_by";

// ---------------------------------------------------------------------------
// Pool registry
// ---------------------------------------------------------------------------

static POOLS: OnceLock<Mutex<HashMap<String, PgPool>>> = OnceLock::new();

fn pools() -> &'static Mutex<HashMap<String, PgPool>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide pool per connection string, created lazily.
pub async fn pool_for(url: &str) -> Result<PgPool> {
    if let Some(pool) = pools().lock().expect("pool registry poisoned").get(url) {
        return Ok(pool.clone());
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;

    let mut registry = pools().lock().expect("pool registry poisoned");
    // A concurrent caller may have raced us; keep the first pool.
    let entry = registry.entry(url.to_string()).or_insert_with(|| pool.clone());
    Ok(entry.clone())
}

/// Connect using `IBX_DATABASE_URL`.
pub async fn pool_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    pool_for(&url).await
}

/// Close and drop every registered pool. Call on manager disposal.
pub async fn close_all_pools() {
    let drained: Vec<PgPool> = {
        let mut registry = pools().lock().expect("pool registry poisoned");
        registry.drain().map(|(_, pool)| pool).collect()
    };
    for pool in drained {
        pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Derive a safe table identifier from a prefix and an inbox name: ASCII
/// lowercased, invalid characters mapped to `_`, bounded to the PostgreSQL
/// identifier limit.
fn table_ident(prefix: &str, inbox_name: &str) -> Result<String> {
    let sanitized: String = inbox_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let ident = format!("{prefix}{sanitized}");
    if !ident
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_lowercase() || c == '_')
    {
        return Err(anyhow!("invalid table identifier '{ident}'"));
    }
    if ident.len() > MAX_IDENTIFIER_LEN {
        return Err(anyhow!(
            "table identifier '{ident}' exceeds {MAX_IDENTIFIER_LEN} characters"
        ));
    }
    Ok(ident)
}

// ---------------------------------------------------------------------------
// Fault classification
// ---------------------------------------------------------------------------

/// Classifies sqlx faults for the retry executor. Connection problems,
/// serialization failures, deadlocks, and admission pressure are transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresErrorClassifier;

impl ErrorClassifier for PostgresErrorClassifier {
    fn is_transient(&self, error: &anyhow::Error) -> bool {
        let Some(err) = error.downcast_ref::<sqlx::Error>() else {
            return false;
        };
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => {
                let Some(code) = db.code() else { return false };
                let code = code.as_ref();
                // 08xxx connection, 40001 serialization, 40P01 deadlock,
                // 53300 too many connections, 57P03 cannot_connect_now.
                code.starts_with("08")
                    || code == "40001"
                    || code == "40P01"
                    || code == "53300"
                    || code == "57P03"
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// PostgreSQL backing store for one named inbox.
pub struct PostgresInboxStore {
    pool: PgPool,
    inbox_name: String,
    fifo: bool,
    read_batch_size: i64,
    max_processing_time: chrono::Duration,
    enable_deduplication: bool,
    deduplication_interval: chrono::Duration,
    messages_table: String,
    dead_letters_table: String,
    dedup_table: String,
    locks_table: String,
}

impl PostgresInboxStore {
    pub fn new(pool: PgPool, inbox_name: impl Into<String>, options: &InboxOptions) -> Result<Self> {
        let inbox_name = inbox_name.into();
        Ok(Self {
            pool,
            fifo: options.delivery_mode.is_fifo(),
            read_batch_size: options.read_batch_size as i64,
            max_processing_time: options.max_processing_time_chrono(),
            enable_deduplication: options.enable_deduplication,
            deduplication_interval: options.deduplication_interval_chrono(),
            messages_table: table_ident("inbox_messages_", &inbox_name)?,
            dead_letters_table: table_ident("inbox_dead_letters_", &inbox_name)?,
            dedup_table: table_ident("inbox_deduplications_", &inbox_name)?,
            locks_table: table_ident("inbox_group_locks_", &inbox_name)?,
            inbox_name,
        })
    }

    /// Connect through the process-wide pool registry.
    pub async fn connect(url: &str, inbox_name: impl Into<String>, options: &InboxOptions) -> Result<Self> {
        let pool = pool_for(url).await?;
        Self::new(pool, inbox_name, options)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_processing_time
    }

    fn row_to_message(&self, row: &PgRow) -> Result<Message> {
        Ok(Message {
            id: row.try_get("id")?,
            inbox_name: self.inbox_name.clone(),
            message_type: row.try_get("message_type")?,
            payload: row.try_get("payload")?,
            group_id: row.try_get("group_id")?,
            collapse_key: row.try_get("collapse_key")?,
            deduplication_id: row.try_get("deduplication_id")?,
            attempts_count: row.try_get("attempts_count")?,
            received_at: row.try_get("received_at")?,
            captured_at: row.try_get("captured_at")?,
            captured_by: row.try_get("captured_by")?,
        })
    }

    fn row_to_dead_letter(&self, row: &PgRow) -> Result<DeadLetterMessage> {
        Ok(DeadLetterMessage {
            id: row.try_get("id")?,
            inbox_name: self.inbox_name.clone(),
            message_type: row.try_get("message_type")?,
            payload: row.try_get("payload")?,
            group_id: row.try_get("group_id")?,
            collapse_key: row.try_get("collapse_key")?,
            deduplication_id: row.try_get("deduplication_id")?,
            attempts_count: row.try_get("attempts_count")?,
            received_at: row.try_get("received_at")?,
            failure_reason: row.try_get("failure_reason")?,
            moved_at: row.try_get("moved_at")?,
        })
    }

    async fn write_one(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Collapse: drop older pending messages with the same key, atomic
        // with the insert because both run inside the batch transaction.
        if let Some(collapse_key) = &message.collapse_key {
            sqlx::query(&format!(
                "delete from {m} where collapse_key = $1 and captured_at is null",
                m = self.messages_table
            ))
            .bind(collapse_key)
            .execute(&mut **tx)
            .await
            .context("collapse delete failed")?;
        }

        if self.enable_deduplication {
            if let Some(dedup_id) = &message.deduplication_id {
                // Claim the dedup slot; an existing record only loses the
                // claim once it has outlived the deduplication interval.
                let claimed: Option<(String,)> = sqlx::query_as(&format!(
                    r#"
                    insert into {d} (deduplication_id, created_at)
                    values ($1, $2)
                    on conflict (deduplication_id) do update
                        set created_at = excluded.created_at
                        where {d}.created_at <= $3
                    returning deduplication_id
                    "#,
                    d = self.dedup_table
                ))
                .bind(dedup_id)
                .bind(now)
                .bind(now - self.deduplication_interval)
                .fetch_optional(&mut **tx)
                .await
                .context("dedup claim failed")?;

                if claimed.is_none() {
                    // Duplicate inside the window: drop silently.
                    return Ok(());
                }
            }
        }

        sqlx::query(&format!(
            r#"
            insert into {m} ({MESSAGE_COLUMNS})
            values ($1, $2, $3, $4, $5, $6, $7, $8, null, null)
            "#,
            m = self.messages_table
        ))
        .bind(message.id)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(&message.group_id)
        .bind(&message.collapse_key)
        .bind(&message.deduplication_id)
        .bind(message.attempts_count)
        .bind(message.received_at)
        .execute(&mut **tx)
        .await
        .context("message insert failed")?;

        Ok(())
    }

    async fn capture_default(&self, processor_id: &str, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r#"
            with to_capture as (
                select id
                from {m}
                where captured_at is null or captured_at <= $1
                order by received_at asc, id asc
                limit $2
                for update skip locked
            )
            update {m}
               set captured_at = $3,
                   captured_by = $4
              from to_capture
             where {m}.id = to_capture.id
            returning {m}.id, {m}.message_type, {m}.payload, {m}.group_id,
                      {m}.collapse_key, {m}.deduplication_id, {m}.attempts_count,
                      {m}.received_at, {m}.captured_at, {m}.captured_by
            "#,
            m = self.messages_table
        ))
        .bind(self.stale_cutoff(now))
        .bind(self.read_batch_size)
        .bind(now)
        .bind(processor_id)
        .fetch_all(&self.pool)
        .await
        .context("capture failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.row_to_message(row)?);
        }
        out.sort_by_key(Message::order_key);
        if !out.is_empty() {
            debug!(inbox = %self.inbox_name, captured = out.len(), processor_id, "captured batch");
        }
        Ok(out)
    }

    /// FIFO capture: pick eligible groups (no lock, stale lock, or our own),
    /// acquire their locks with an insert-or-overwrite-if-stale upsert, then
    /// capture messages belonging to the acquired groups. The upsert's WHERE
    /// arbitrates races on the lock row — the loser acquires nothing and
    /// captures nothing from that group.
    async fn capture_fifo(&self, processor_id: &str, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r#"
            with candidate_groups as (
                select m.group_id
                from {m} m
                left join {l} l on l.group_id = m.group_id
                where (m.captured_at is null or m.captured_at <= $1)
                  and m.group_id is not null
                  and (l.group_id is null or l.locked_at <= $1 or l.locked_by = $4)
                group by m.group_id
                order by min(m.received_at) asc
                limit $2
            ),
            acquired as (
                insert into {l} (group_id, locked_at, locked_by)
                select group_id, $3, $4 from candidate_groups
                on conflict (group_id) do update
                    set locked_at = excluded.locked_at,
                        locked_by = excluded.locked_by
                    where {l}.locked_at <= $1 or {l}.locked_by = excluded.locked_by
                returning group_id
            ),
            to_capture as (
                select m.id
                from {m} m
                join acquired a on m.group_id = a.group_id
                where m.captured_at is null or m.captured_at <= $1
                order by m.received_at asc, m.id asc
                limit $2
                for update of m skip locked
            )
            update {m}
               set captured_at = $3,
                   captured_by = $4
              from to_capture
             where {m}.id = to_capture.id
            returning {m}.id, {m}.message_type, {m}.payload, {m}.group_id,
                      {m}.collapse_key, {m}.deduplication_id, {m}.attempts_count,
                      {m}.received_at, {m}.captured_at, {m}.captured_by
            "#,
            m = self.messages_table,
            l = self.locks_table
        ))
        .bind(self.stale_cutoff(now))
        .bind(self.read_batch_size)
        .bind(now)
        .bind(processor_id)
        .fetch_all(&self.pool)
        .await
        .context("fifo capture failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.row_to_message(row)?);
        }
        out.sort_by_key(Message::order_key);
        Ok(out)
    }

    async fn move_to_dead_letter_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entries: &[(Uuid, String)],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = entries.iter().map(|(id, _)| *id).collect();
        let reasons: Vec<String> = entries.iter().map(|(_, reason)| reason.clone()).collect();

        // Copy-then-delete in one statement; ids already moved (no primary
        // row) or moved twice (conflict) are no-ops.
        sqlx::query(&format!(
            r#"
            with moved as (
                delete from {m}
                 where id = any($1)
                returning id, message_type, payload, group_id, collapse_key,
                          deduplication_id, attempts_count, received_at
            )
            insert into {d} (id, message_type, payload, group_id, collapse_key,
                             deduplication_id, attempts_count, received_at,
                             failure_reason, moved_at)
            select moved.id, moved.message_type, moved.payload, moved.group_id,
                   moved.collapse_key, moved.deduplication_id, moved.attempts_count,
                   moved.received_at, reasons.reason, $3
              from moved
              join unnest($1::uuid[], $2::text[]) as reasons(id, reason)
                on reasons.id = moved.id
            on conflict (id) do nothing
            "#,
            m = self.messages_table,
            d = self.dead_letters_table
        ))
        .bind(&ids)
        .bind(&reasons)
        .bind(now)
        .execute(&mut **tx)
        .await
        .context("dead letter move failed")?;

        Ok(())
    }
}

#[async_trait]
impl StorageProvider for PostgresInboxStore {
    fn inbox_name(&self) -> &str {
        &self.inbox_name
    }

    async fn write_batch(&self, messages: Vec<Message>) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("begin write failed")?;
        for message in &messages {
            self.write_one(&mut tx, message, now).await?;
        }
        tx.commit().await.context("commit write failed")?;
        Ok(())
    }

    async fn read_and_capture(&self, processor_id: &str) -> anyhow::Result<Vec<Message>> {
        let now = Utc::now();
        if self.fifo {
            self.capture_fifo(processor_id, now).await
        } else {
            self.capture_default(processor_id, now).await
        }
    }

    async fn fail_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&format!(
            r#"
            update {m}
               set attempts_count = attempts_count + 1,
                   captured_at = null,
                   captured_by = null
             where id = any($1)
            "#,
            m = self.messages_table
        ))
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("fail batch failed")?;
        Ok(())
    }

    async fn release_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&format!(
            r#"
            update {m}
               set captured_at = null,
                   captured_by = null
             where id = any($1)
            "#,
            m = self.messages_table
        ))
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("release batch failed")?;
        Ok(())
    }

    async fn move_to_dead_letter_batch(&self, entries: &[(Uuid, String)]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("begin dead letter move failed")?;
        self.move_to_dead_letter_tx(&mut tx, entries, now).await?;
        tx.commit().await.context("commit dead letter move failed")?;
        Ok(())
    }

    async fn process_results_batch(&self, results: ProcessResults) -> anyhow::Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("begin results commit failed")?;

        if !results.complete.is_empty() {
            sqlx::query(&format!(
                "delete from {m} where id = any($1)",
                m = self.messages_table
            ))
            .bind(&results.complete)
            .execute(&mut *tx)
            .await
            .context("complete delete failed")?;
        }

        if !results.fail.is_empty() {
            sqlx::query(&format!(
                r#"
                update {m}
                   set attempts_count = attempts_count + 1,
                       captured_at = null,
                       captured_by = null
                 where id = any($1)
                "#,
                m = self.messages_table
            ))
            .bind(&results.fail)
            .execute(&mut *tx)
            .await
            .context("fail update failed")?;
        }

        if !results.release.is_empty() {
            sqlx::query(&format!(
                r#"
                update {m}
                   set captured_at = null,
                       captured_by = null
                 where id = any($1)
                "#,
                m = self.messages_table
            ))
            .bind(&results.release)
            .execute(&mut *tx)
            .await
            .context("release update failed")?;
        }

        self.move_to_dead_letter_tx(&mut tx, &results.dead_letter, now).await?;

        tx.commit().await.context("commit results failed")?;
        Ok(())
    }

    async fn read_dead_letters(&self, count: usize) -> anyhow::Result<Vec<DeadLetterMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            select id, message_type, payload, group_id, collapse_key,
                   deduplication_id, attempts_count, received_at,
                   failure_reason, moved_at
              from {d}
             order by moved_at asc, id asc
             limit $1
            "#,
            d = self.dead_letters_table
        ))
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .context("read dead letters failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.row_to_dead_letter(row)?);
        }
        Ok(out)
    }

    async fn requeue_dead_letters(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&format!(
            r#"
            with revived as (
                delete from {d}
                 where id = any($1)
                returning id, message_type, payload, group_id, collapse_key,
                          deduplication_id, received_at
            )
            insert into {m} ({MESSAGE_COLUMNS})
            select id, message_type, payload, group_id, collapse_key,
                   deduplication_id, 0, received_at, null, null
              from revived
            on conflict (id) do nothing
            "#,
            d = self.dead_letters_table,
            m = self.messages_table
        ))
        .bind(ids)
        .execute(&self.pool)
        .await
        .context("dead letter requeue failed")?;
        Ok(result.rows_affected())
    }

    async fn extend_locks(
        &self,
        processor_id: &str,
        ids: &[Uuid],
        new_captured_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = if self.fifo {
            format!(
                r#"
                with extended as (
                    update {m}
                       set captured_at = $1
                     where id = any($2)
                       and captured_by = $3
                    returning group_id
                ),
                lock_refresh as (
                    update {l}
                       set locked_at = $1
                     where locked_by = $3
                       and group_id in (select group_id from extended where group_id is not null)
                )
                select count(*)::bigint as extended from extended
                "#,
                m = self.messages_table,
                l = self.locks_table
            )
        } else {
            format!(
                r#"
                with extended as (
                    update {m}
                       set captured_at = $1
                     where id = any($2)
                       and captured_by = $3
                    returning id
                )
                select count(*)::bigint as extended from extended
                "#,
                m = self.messages_table
            )
        };

        let (extended,): (i64,) = sqlx::query_as(&sql)
            .bind(new_captured_at)
            .bind(ids)
            .bind(processor_id)
            .fetch_one(&self.pool)
            .await
            .context("extend locks failed")?;

        Ok(extended as usize)
    }

    async fn health_metrics(&self) -> anyhow::Result<StorageHealthMetrics> {
        // One filtered-aggregate scan of the primary table.
        let row = sqlx::query(&format!(
            r#"
            select count(*) filter (where captured_at is null)     as pending,
                   count(*) filter (where captured_at is not null) as captured,
                   min(received_at) filter (where captured_at is null) as oldest_pending_at
              from {m}
            "#,
            m = self.messages_table
        ))
        .fetch_one(&self.pool)
        .await
        .context("health metrics query failed")?;

        let (dead_letter,): (i64,) = sqlx::query_as(&format!(
            "select count(*)::bigint from {d}",
            d = self.dead_letters_table
        ))
        .fetch_one(&self.pool)
        .await
        .context("dead letter count failed")?;

        Ok(StorageHealthMetrics {
            pending: row.try_get::<i64, _>("pending")? as u64,
            captured: row.try_get::<i64, _>("captured")? as u64,
            dead_letter: dead_letter as u64,
            oldest_pending_at: row.try_get("oldest_pending_at")?,
        })
    }

    async fn release_group_locks(&self, group_ids: &[String]) -> anyhow::Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(&format!(
            "delete from {l} where group_id = any($1)",
            l = self.locks_table
        ))
        .bind(group_ids)
        .execute(&self.pool)
        .await
        .context("group lock release failed")?;
        Ok(())
    }

    async fn release_messages_and_group_locks(&self, messages: &[Message]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        let mut groups: Vec<String> = messages
            .iter()
            .filter_map(|m| m.group_id.clone())
            .collect();
        groups.sort();
        groups.dedup();

        let mut tx = self.pool.begin().await.context("begin combined release failed")?;
        sqlx::query(&format!(
            r#"
            update {m}
               set captured_at = null,
                   captured_by = null
             where id = any($1)
            "#,
            m = self.messages_table
        ))
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("combined message release failed")?;

        if !groups.is_empty() {
            sqlx::query(&format!(
                "delete from {l} where group_id = any($1)",
                l = self.locks_table
            ))
            .bind(&groups)
            .execute(&mut *tx)
            .await
            .context("combined lock release failed")?;
        }

        tx.commit().await.context("commit combined release failed")?;
        Ok(())
    }

    async fn delete_expired_deduplications(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            delete from {d}
             where deduplication_id in (
                select deduplication_id from {d}
                 where created_at < $1
                 limit $2
             )
            "#,
            d = self.dedup_table
        ))
        .bind(cutoff)
        .bind(i64::from(batch))
        .execute(&self.pool)
        .await
        .context("dedup cleanup failed")?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_group_locks(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            delete from {l}
             where group_id in (
                select group_id from {l}
                 where locked_at < $1
                 limit $2
             )
            "#,
            l = self.locks_table
        ))
        .bind(cutoff)
        .bind(i64::from(batch))
        .execute(&self.pool)
        .await
        .context("group lock cleanup failed")?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_dead_letters(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            delete from {d}
             where id in (
                select id from {d}
                 where moved_at < $1
                 limit $2
             )
            "#,
            d = self.dead_letters_table
        ))
        .bind(cutoff)
        .bind(i64::from(batch))
        .execute(&self.pool)
        .await
        .context("dead letter cleanup failed")?;
        Ok(result.rows_affected())
    }

    /// Idempotent schema creation. Table names are derived from the inbox
    /// name, so embedded migration files do not apply here.
    async fn migrate(&self) -> anyhow::Result<()> {
        let statements = [
            format!(
                r#"
                create table if not exists {m} (
                    id uuid primary key,
                    message_type text not null,
                    payload text not null,
                    group_id text,
                    collapse_key text,
                    deduplication_id text,
                    attempts_count int not null default 0,
                    received_at timestamptz not null,
                    captured_at timestamptz,
                    captured_by text
                )
                "#,
                m = self.messages_table
            ),
            format!(
                "create index if not exists {m}_received_idx on {m} (received_at, id)",
                m = self.messages_table
            ),
            format!(
                "create index if not exists {m}_collapse_idx on {m} (collapse_key) where collapse_key is not null and captured_at is null",
                m = self.messages_table
            ),
            format!(
                "create index if not exists {m}_group_idx on {m} (group_id) where group_id is not null",
                m = self.messages_table
            ),
            format!(
                r#"
                create table if not exists {d} (
                    id uuid primary key,
                    message_type text not null,
                    payload text not null,
                    group_id text,
                    collapse_key text,
                    deduplication_id text,
                    attempts_count int not null default 0,
                    received_at timestamptz not null,
                    failure_reason text not null,
                    moved_at timestamptz not null
                )
                "#,
                d = self.dead_letters_table
            ),
            format!(
                "create index if not exists {d}_moved_idx on {d} (moved_at, id)",
                d = self.dead_letters_table
            ),
            format!(
                r#"
                create table if not exists {t} (
                    deduplication_id text primary key,
                    created_at timestamptz not null
                )
                "#,
                t = self.dedup_table
            ),
            format!(
                r#"
                create table if not exists {l} (
                    group_id text primary key,
                    locked_at timestamptz not null,
                    locked_by text not null
                )
                "#,
                l = self.locks_table
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration statement failed: {statement}"))?;
        }
        info!(inbox = %self.inbox_name, table = %self.messages_table, "inbox schema ensured");
        Ok(())
    }
}
