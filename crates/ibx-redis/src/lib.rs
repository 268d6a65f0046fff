//! ibx-redis
//!
//! Key-value storage provider on Redis.
//!
//! Keyspaces per inbox prefix `ibx:<name>:` —
//!
//! | key | type | content |
//! |---|---|---|
//! | `pending` | zset | message id scored by `received_at` millis |
//! | `captured` | zset | message id scored by `captured_at` millis |
//! | `msg:<id>` | hash | message fields |
//! | `collapse` | hash | `collapse_key` → latest pending id |
//! | `dedup:<id>` | string | dedup guard, TTL = deduplication interval |
//! | `lock:<group>` | string | owning processor id, TTL = max processing time |
//! | `dead` | zset | dead-letter id scored by `moved_at` millis |
//! | `dead:<id>` | hash | frozen message + failure reason |
//!
//! Multi-step operations run as server-side Lua scripts so each provider
//! call is one atomic round-trip; dedup guards and group locks expire via
//! key TTLs, which stands in for the relational backend's cleanup deletes.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;
use uuid::Uuid;

use ibx_core::message::{DeadLetterMessage, Message};
use ibx_core::options::InboxOptions;
use ibx_core::provider::{ProcessResults, StorageHealthMetrics, StorageProvider};
use ibx_core::retry::ErrorClassifier;

pub const ENV_REDIS_URL: &str = "IBX_REDIS_URL";

/// Upper bound on pending entries one FIFO capture scan inspects while
/// skipping locked groups.
const FIFO_SCAN_LIMIT: usize = 1024;

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

static MANAGERS: OnceLock<Mutex<HashMap<String, ConnectionManager>>> = OnceLock::new();

fn managers() -> &'static Mutex<HashMap<String, ConnectionManager>> {
    MANAGERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide auto-reconnecting connection per URL, created lazily.
pub async fn connection_for(url: &str) -> Result<ConnectionManager> {
    if let Some(manager) = managers().lock().expect("manager registry poisoned").get(url) {
        return Ok(manager.clone());
    }

    let client = redis::Client::open(url).context("invalid redis url")?;
    let manager = client
        .get_connection_manager()
        .await
        .context("failed to connect to Redis")?;

    let mut registry = managers().lock().expect("manager registry poisoned");
    let entry = registry
        .entry(url.to_string())
        .or_insert_with(|| manager.clone());
    Ok(entry.clone())
}

pub async fn connection_from_env() -> Result<ConnectionManager> {
    let url = std::env::var(ENV_REDIS_URL).with_context(|| format!("missing env var {ENV_REDIS_URL}"))?;
    connection_for(&url).await
}

/// Drop every registered connection. Call on manager disposal.
pub fn close_all_connections() {
    managers().lock().expect("manager registry poisoned").clear();
}

// ---------------------------------------------------------------------------
// Fault classification
// ---------------------------------------------------------------------------

/// Classifies redis faults for the retry executor. Dropped connections,
/// timeouts, `LOADING`, `TRYAGAIN`, and failover states are transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisErrorClassifier;

impl ErrorClassifier for RedisErrorClassifier {
    fn is_transient(&self, error: &anyhow::Error) -> bool {
        let Some(err) = error.downcast_ref::<redis::RedisError>() else {
            return false;
        };
        if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
            return true;
        }
        matches!(
            err.kind(),
            redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::TryAgain
                | redis::ErrorKind::MasterDown
                | redis::ErrorKind::ClusterDown
        )
    }
}

// ---------------------------------------------------------------------------
// Time encoding
// ---------------------------------------------------------------------------

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// Write one message: dedup guard, collapse of the previous pending holder
/// of the same key, then insert.
/// KEYS: pending, collapse, msg, dedup  ARGV: id, received_ms, collapse_key,
/// dedup_ttl_ms, msg_prefix, message_type, payload, group_id, dedup_id,
/// attempts
const WRITE_SCRIPT: &str = r#"
if ARGV[4] ~= '0' then
    if redis.call('EXISTS', KEYS[4]) == 1 then
        return 0
    end
    redis.call('SET', KEYS[4], '1', 'PX', tonumber(ARGV[4]))
end
if ARGV[3] ~= '' then
    local prev = redis.call('HGET', KEYS[2], ARGV[3])
    if prev and prev ~= ARGV[1] then
        if redis.call('ZREM', KEYS[1], prev) == 1 then
            redis.call('DEL', ARGV[5] .. prev)
        end
    end
    redis.call('HSET', KEYS[2], ARGV[3], ARGV[1])
end
redis.call('HSET', KEYS[3],
    'message_type', ARGV[6],
    'payload', ARGV[7],
    'group_id', ARGV[8],
    'collapse_key', ARGV[3],
    'deduplication_id', ARGV[9],
    'attempts_count', ARGV[10],
    'received_at', ARGV[2],
    'captured_at', '',
    'captured_by', '')
redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), ARGV[1])
return 1
"#;

/// Capture up to `batch` pending ids, oldest first. Both capture scripts
/// start by moving stale entries of the captured zset back to pending.
/// KEYS: pending, captured  ARGV: now_ms, stale_cutoff_ms, batch, msg_prefix,
/// processor_id
const CAPTURE_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(stale) do
    local key = ARGV[4] .. id
    if redis.call('EXISTS', key) == 1 then
        local received = redis.call('HGET', key, 'received_at')
        redis.call('HSET', key, 'captured_at', '', 'captured_by', '')
        redis.call('ZADD', KEYS[1], tonumber(received), id)
    end
    redis.call('ZREM', KEYS[2], id)
end
local ids = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[3]) - 1)
for _, id in ipairs(ids) do
    redis.call('HSET', ARGV[4] .. id, 'captured_at', ARGV[1], 'captured_by', ARGV[5])
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZADD', KEYS[2], tonumber(ARGV[1]), id)
end
return ids
"#;

/// FIFO capture: walk pending oldest-first, skip groups whose lock key is
/// held by someone else, acquire/refresh our lock on capture.
/// KEYS: pending, captured  ARGV: now_ms, stale_cutoff_ms, batch, msg_prefix,
/// processor_id, lock_prefix, lock_ttl_ms, scan_limit
const CAPTURE_FIFO_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(stale) do
    local key = ARGV[4] .. id
    if redis.call('EXISTS', key) == 1 then
        local received = redis.call('HGET', key, 'received_at')
        redis.call('HSET', key, 'captured_at', '', 'captured_by', '')
        redis.call('ZADD', KEYS[1], tonumber(received), id)
    end
    redis.call('ZREM', KEYS[2], id)
end
local taken = {}
local blocked = {}
local candidates = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[8]) - 1)
for _, id in ipairs(candidates) do
    if #taken >= tonumber(ARGV[3]) then
        break
    end
    local key = ARGV[4] .. id
    local group = redis.call('HGET', key, 'group_id')
    if group and group ~= '' and not blocked[group] then
        local lock_key = ARGV[6] .. group
        local owner = redis.call('GET', lock_key)
        if owner == false or owner == ARGV[5] then
            redis.call('SET', lock_key, ARGV[5], 'PX', tonumber(ARGV[7]))
            redis.call('HSET', key, 'captured_at', ARGV[1], 'captured_by', ARGV[5])
            redis.call('ZREM', KEYS[1], id)
            redis.call('ZADD', KEYS[2], tonumber(ARGV[1]), id)
            table.insert(taken, id)
        else
            blocked[group] = true
        end
    end
end
return taken
"#;

/// Apply the four result subsets in one atomic step.
/// KEYS: pending, captured, dead, collapse
/// ARGV: msg_prefix, dead_prefix, now_ms,
///       n_complete, ids..., n_fail, ids..., n_release, ids...,
///       n_dead, (id, reason)...
const APPLY_RESULTS_SCRIPT: &str = r#"
local msg_prefix = ARGV[1]
local dead_prefix = ARGV[2]
local now = ARGV[3]
local i = 4

local function drop_collapse_ref(key, id)
    local ck = redis.call('HGET', key, 'collapse_key')
    if ck and ck ~= '' and redis.call('HGET', KEYS[4], ck) == id then
        redis.call('HDEL', KEYS[4], ck)
    end
end

local n = tonumber(ARGV[i]); i = i + 1
for _ = 1, n do
    local id = ARGV[i]; i = i + 1
    local key = msg_prefix .. id
    drop_collapse_ref(key, id)
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZREM', KEYS[2], id)
    redis.call('DEL', key)
end

n = tonumber(ARGV[i]); i = i + 1
for _ = 1, n do
    local id = ARGV[i]; i = i + 1
    local key = msg_prefix .. id
    if redis.call('EXISTS', key) == 1 then
        redis.call('HINCRBY', key, 'attempts_count', 1)
        local received = redis.call('HGET', key, 'received_at')
        redis.call('HSET', key, 'captured_at', '', 'captured_by', '')
        redis.call('ZREM', KEYS[2], id)
        redis.call('ZADD', KEYS[1], tonumber(received), id)
    end
end

n = tonumber(ARGV[i]); i = i + 1
for _ = 1, n do
    local id = ARGV[i]; i = i + 1
    local key = msg_prefix .. id
    if redis.call('EXISTS', key) == 1 then
        local received = redis.call('HGET', key, 'received_at')
        redis.call('HSET', key, 'captured_at', '', 'captured_by', '')
        redis.call('ZREM', KEYS[2], id)
        redis.call('ZADD', KEYS[1], tonumber(received), id)
    end
end

n = tonumber(ARGV[i]); i = i + 1
for _ = 1, n do
    local id = ARGV[i]; i = i + 1
    local reason = ARGV[i]; i = i + 1
    local key = msg_prefix .. id
    if redis.call('EXISTS', key) == 1 then
        local fields = redis.call('HGETALL', key)
        local dead_key = dead_prefix .. id
        redis.call('DEL', dead_key)
        for f = 1, #fields, 2 do
            redis.call('HSET', dead_key, fields[f], fields[f + 1])
        end
        redis.call('HSET', dead_key, 'failure_reason', reason, 'moved_at', now)
        redis.call('ZADD', KEYS[3], tonumber(now), id)
        drop_collapse_ref(key, id)
        redis.call('ZREM', KEYS[1], id)
        redis.call('ZREM', KEYS[2], id)
        redis.call('DEL', key)
    end
end
return 1
"#;

/// Extend capture locks owned by this processor and refresh their group
/// lock keys.
/// KEYS: captured  ARGV: processor_id, new_ms, msg_prefix, lock_prefix,
/// lock_ttl_ms, ids...
const EXTEND_SCRIPT: &str = r#"
local extended = 0
for i = 6, #ARGV do
    local id = ARGV[i]
    local key = ARGV[3] .. id
    if redis.call('HGET', key, 'captured_by') == ARGV[1] then
        redis.call('HSET', key, 'captured_at', ARGV[2])
        redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), id)
        local group = redis.call('HGET', key, 'group_id')
        if group and group ~= '' then
            redis.call('SET', ARGV[4] .. group, ARGV[1], 'PX', tonumber(ARGV[5]))
        end
        extended = extended + 1
    end
end
return extended
"#;

/// Release messages and delete their group lock keys in one step.
/// KEYS: pending, captured  ARGV: msg_prefix, lock_prefix,
/// n_ids, ids..., n_groups, groups...
const RELEASE_COMBINED_SCRIPT: &str = r#"
local i = 3
local n = tonumber(ARGV[i]); i = i + 1
for _ = 1, n do
    local id = ARGV[i]; i = i + 1
    local key = ARGV[1] .. id
    if redis.call('EXISTS', key) == 1 then
        local received = redis.call('HGET', key, 'received_at')
        redis.call('HSET', key, 'captured_at', '', 'captured_by', '')
        redis.call('ZREM', KEYS[2], id)
        redis.call('ZADD', KEYS[1], tonumber(received), id)
    end
end
n = tonumber(ARGV[i]); i = i + 1
for _ = 1, n do
    local group = ARGV[i]; i = i + 1
    redis.call('DEL', ARGV[2] .. group)
end
return 1
"#;

/// Revive dead letters as pending messages with attempts reset.
/// KEYS: pending, dead  ARGV: msg_prefix, dead_prefix, ids...
const REQUEUE_SCRIPT: &str = r#"
local revived = 0
for i = 3, #ARGV do
    local id = ARGV[i]
    local dead_key = ARGV[2] .. id
    if redis.call('EXISTS', dead_key) == 1 then
        local fields = redis.call('HGETALL', dead_key)
        local key = ARGV[1] .. id
        redis.call('DEL', key)
        local received = '0'
        for f = 1, #fields, 2 do
            local name = fields[f]
            if name ~= 'failure_reason' and name ~= 'moved_at' then
                redis.call('HSET', key, name, fields[f + 1])
            end
            if name == 'received_at' then
                received = fields[f + 1]
            end
        end
        redis.call('HSET', key, 'attempts_count', '0', 'captured_at', '', 'captured_by', '')
        redis.call('ZADD', KEYS[1], tonumber(received), id)
        redis.call('ZREM', KEYS[2], id)
        redis.call('DEL', dead_key)
        revived = revived + 1
    end
end
return revived
"#;

/// Delete up to `batch` dead letters moved before the cutoff.
/// KEYS: dead  ARGV: dead_prefix, cutoff_ms, batch
const CLEANUP_DEAD_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2], 'LIMIT', 0, tonumber(ARGV[3]))
for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[1] .. id)
    redis.call('ZREM', KEYS[1], id)
end
return #ids
"#;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

struct Keys {
    pending: String,
    captured: String,
    collapse: String,
    dead: String,
    msg_prefix: String,
    dead_prefix: String,
    dedup_prefix: String,
    lock_prefix: String,
}

impl Keys {
    fn new(inbox_name: &str) -> Self {
        let prefix = format!("ibx:{inbox_name}:");
        Self {
            pending: format!("{prefix}pending"),
            captured: format!("{prefix}captured"),
            collapse: format!("{prefix}collapse"),
            dead: format!("{prefix}dead"),
            msg_prefix: format!("{prefix}msg:"),
            dead_prefix: format!("{prefix}dead:"),
            dedup_prefix: format!("{prefix}dedup:"),
            lock_prefix: format!("{prefix}lock:"),
        }
    }
}

/// Redis backing store for one named inbox.
pub struct RedisInboxStore {
    conn: ConnectionManager,
    inbox_name: String,
    keys: Keys,
    fifo: bool,
    read_batch_size: usize,
    max_processing_ms: i64,
    enable_deduplication: bool,
    deduplication_ms: i64,
    write_script: Script,
    capture_script: Script,
    capture_fifo_script: Script,
    apply_script: Script,
    extend_script: Script,
    release_combined_script: Script,
    requeue_script: Script,
    cleanup_dead_script: Script,
}

impl RedisInboxStore {
    pub fn new(conn: ConnectionManager, inbox_name: impl Into<String>, options: &InboxOptions) -> Self {
        let inbox_name = inbox_name.into();
        Self {
            keys: Keys::new(&inbox_name),
            conn,
            fifo: options.delivery_mode.is_fifo(),
            read_batch_size: options.read_batch_size,
            max_processing_ms: options.max_processing_time.as_millis() as i64,
            enable_deduplication: options.enable_deduplication,
            deduplication_ms: options.deduplication_interval.as_millis() as i64,
            write_script: Script::new(WRITE_SCRIPT),
            capture_script: Script::new(CAPTURE_SCRIPT),
            capture_fifo_script: Script::new(CAPTURE_FIFO_SCRIPT),
            apply_script: Script::new(APPLY_RESULTS_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            release_combined_script: Script::new(RELEASE_COMBINED_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            cleanup_dead_script: Script::new(CLEANUP_DEAD_SCRIPT),
            inbox_name,
        }
    }

    /// Connect through the process-wide connection registry.
    pub async fn connect(url: &str, inbox_name: impl Into<String>, options: &InboxOptions) -> Result<Self> {
        let conn = connection_for(url).await?;
        Ok(Self::new(conn, inbox_name, options))
    }

    fn stale_cutoff_ms(&self, now: DateTime<Utc>) -> i64 {
        to_millis(now) - self.max_processing_ms
    }

    fn parse_message(&self, id: Uuid, fields: &HashMap<String, String>) -> Result<Message> {
        let opt = |name: &str| -> Option<String> {
            fields.get(name).filter(|v| !v.is_empty()).cloned()
        };
        let received_ms: i64 = fields
            .get("received_at")
            .ok_or_else(|| anyhow!("message {id} is missing received_at"))?
            .parse()
            .context("received_at is not an integer")?;
        let captured_at = match opt("captured_at") {
            Some(ms) => Some(from_millis(ms.parse().context("captured_at is not an integer")?)?),
            None => None,
        };

        Ok(Message {
            id,
            inbox_name: self.inbox_name.clone(),
            message_type: fields
                .get("message_type")
                .cloned()
                .ok_or_else(|| anyhow!("message {id} is missing message_type"))?,
            payload: fields.get("payload").cloned().unwrap_or_default(),
            group_id: opt("group_id"),
            collapse_key: opt("collapse_key"),
            deduplication_id: opt("deduplication_id"),
            attempts_count: fields
                .get("attempts_count")
                .map(|v| v.parse())
                .transpose()
                .context("attempts_count is not an integer")?
                .unwrap_or(0),
            received_at: from_millis(received_ms)?,
            captured_at,
            captured_by: opt("captured_by"),
        })
    }

    async fn fetch_messages(&self, ids: Vec<String>) -> Result<Vec<Message>> {
        let mut conn = self.conn.clone();
        let mut out = Vec::with_capacity(ids.len());
        for id_text in ids {
            let id: Uuid = id_text.parse().context("captured id is not a uuid")?;
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(format!("{}{}", self.keys.msg_prefix, id_text))
                .query_async(&mut conn)
                .await
                .context("message fetch failed")?;
            if fields.is_empty() {
                continue;
            }
            out.push(self.parse_message(id, &fields)?);
        }
        out.sort_by_key(Message::order_key);
        Ok(out)
    }

    async fn apply(&self, results: &ProcessResults) -> Result<()> {
        let now = Utc::now();
        let mut invocation = self.apply_script.prepare_invoke();
        invocation
            .key(&self.keys.pending)
            .key(&self.keys.captured)
            .key(&self.keys.dead)
            .key(&self.keys.collapse)
            .arg(&self.keys.msg_prefix)
            .arg(&self.keys.dead_prefix)
            .arg(to_millis(now));

        invocation.arg(results.complete.len());
        for id in &results.complete {
            invocation.arg(id.to_string());
        }
        invocation.arg(results.fail.len());
        for id in &results.fail {
            invocation.arg(id.to_string());
        }
        invocation.arg(results.release.len());
        for id in &results.release {
            invocation.arg(id.to_string());
        }
        invocation.arg(results.dead_letter.len());
        for (id, reason) in &results.dead_letter {
            invocation.arg(id.to_string()).arg(reason);
        }

        let mut conn = self.conn.clone();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .context("result apply script failed")?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for RedisInboxStore {
    fn inbox_name(&self) -> &str {
        &self.inbox_name
    }

    async fn write_batch(&self, messages: Vec<Message>) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        for message in &messages {
            let dedup_ttl = match (&message.deduplication_id, self.enable_deduplication) {
                (Some(_), true) => self.deduplication_ms,
                _ => 0,
            };
            let dedup_key = format!(
                "{}{}",
                self.keys.dedup_prefix,
                message.deduplication_id.as_deref().unwrap_or("-")
            );

            let _: i64 = self
                .write_script
                .key(&self.keys.pending)
                .key(&self.keys.collapse)
                .key(format!("{}{}", self.keys.msg_prefix, message.id))
                .key(dedup_key)
                .arg(message.id.to_string())
                .arg(to_millis(message.received_at))
                .arg(message.collapse_key.as_deref().unwrap_or(""))
                .arg(dedup_ttl)
                .arg(&self.keys.msg_prefix)
                .arg(&message.message_type)
                .arg(&message.payload)
                .arg(message.group_id.as_deref().unwrap_or(""))
                .arg(message.deduplication_id.as_deref().unwrap_or(""))
                .arg(message.attempts_count)
                .invoke_async(&mut conn)
                .await
                .context("write script failed")?;
        }
        Ok(())
    }

    async fn read_and_capture(&self, processor_id: &str) -> anyhow::Result<Vec<Message>> {
        let now = Utc::now();
        let mut conn = self.conn.clone();

        let ids: Vec<String> = if self.fifo {
            self.capture_fifo_script
                .key(&self.keys.pending)
                .key(&self.keys.captured)
                .arg(to_millis(now))
                .arg(self.stale_cutoff_ms(now))
                .arg(self.read_batch_size)
                .arg(&self.keys.msg_prefix)
                .arg(processor_id)
                .arg(&self.keys.lock_prefix)
                .arg(self.max_processing_ms)
                .arg(FIFO_SCAN_LIMIT)
                .invoke_async(&mut conn)
                .await
                .context("fifo capture script failed")?
        } else {
            self.capture_script
                .key(&self.keys.pending)
                .key(&self.keys.captured)
                .arg(to_millis(now))
                .arg(self.stale_cutoff_ms(now))
                .arg(self.read_batch_size)
                .arg(&self.keys.msg_prefix)
                .arg(processor_id)
                .invoke_async(&mut conn)
                .await
                .context("capture script failed")?
        };

        let out = self.fetch_messages(ids).await?;
        if !out.is_empty() {
            debug!(inbox = %self.inbox_name, captured = out.len(), processor_id, "captured batch");
        }
        Ok(out)
    }

    async fn fail_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.apply(&ProcessResults {
            fail: ids.to_vec(),
            ..Default::default()
        })
        .await
    }

    async fn release_batch(&self, ids: &[Uuid]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.apply(&ProcessResults {
            release: ids.to_vec(),
            ..Default::default()
        })
        .await
    }

    async fn move_to_dead_letter_batch(&self, entries: &[(Uuid, String)]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.apply(&ProcessResults {
            dead_letter: entries.to_vec(),
            ..Default::default()
        })
        .await
    }

    async fn process_results_batch(&self, results: ProcessResults) -> anyhow::Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        self.apply(&results).await
    }

    async fn read_dead_letters(&self, count: usize) -> anyhow::Result<Vec<DeadLetterMessage>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.keys.dead)
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut conn)
            .await
            .context("dead letter range failed")?;

        let mut out = Vec::with_capacity(ids.len());
        for id_text in ids {
            let id: Uuid = id_text.parse().context("dead letter id is not a uuid")?;
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(format!("{}{}", self.keys.dead_prefix, id_text))
                .query_async(&mut conn)
                .await
                .context("dead letter fetch failed")?;
            if fields.is_empty() {
                continue;
            }
            let message = self.parse_message(id, &fields)?;
            let moved_ms: i64 = fields
                .get("moved_at")
                .ok_or_else(|| anyhow!("dead letter {id} is missing moved_at"))?
                .parse()
                .context("moved_at is not an integer")?;
            out.push(DeadLetterMessage {
                failure_reason: fields.get("failure_reason").cloned().unwrap_or_default(),
                moved_at: from_millis(moved_ms)?,
                ..DeadLetterMessage::from_message(&message, "", from_millis(moved_ms)?)
            });
        }
        out.sort_by_key(|d| (d.moved_at, d.id));
        Ok(out)
    }

    async fn requeue_dead_letters(&self, ids: &[Uuid]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut invocation = self.requeue_script.prepare_invoke();
        invocation
            .key(&self.keys.pending)
            .key(&self.keys.dead)
            .arg(&self.keys.msg_prefix)
            .arg(&self.keys.dead_prefix);
        for id in ids {
            invocation.arg(id.to_string());
        }

        let mut conn = self.conn.clone();
        let revived: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .context("requeue script failed")?;
        Ok(revived as u64)
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
        let mut invocation = self.extend_script.prepare_invoke();
        invocation
            .key(&self.keys.captured)
            .arg(processor_id)
            .arg(to_millis(new_captured_at))
            .arg(&self.keys.msg_prefix)
            .arg(&self.keys.lock_prefix)
            .arg(self.max_processing_ms);
        for id in ids {
            invocation.arg(id.to_string());
        }

        let mut conn = self.conn.clone();
        let extended: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .context("extend script failed")?;
        Ok(extended as usize)
    }

    async fn health_metrics(&self) -> anyhow::Result<StorageHealthMetrics> {
        let mut conn = self.conn.clone();
        let (pending, captured, dead_letter, oldest): (u64, u64, u64, Vec<(String, f64)>) =
            redis::pipe()
                .cmd("ZCARD").arg(&self.keys.pending)
                .cmd("ZCARD").arg(&self.keys.captured)
                .cmd("ZCARD").arg(&self.keys.dead)
                .cmd("ZRANGE").arg(&self.keys.pending).arg(0).arg(0).arg("WITHSCORES")
                .query_async(&mut conn)
                .await
                .context("health pipeline failed")?;

        let oldest_pending_at = match oldest.first() {
            Some((_, score)) => Some(from_millis(*score as i64)?),
            None => None,
        };

        Ok(StorageHealthMetrics {
            pending,
            captured,
            dead_letter,
            oldest_pending_at,
        })
    }

    async fn release_group_locks(&self, group_ids: &[String]) -> anyhow::Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = group_ids
            .iter()
            .map(|g| format!("{}{}", self.keys.lock_prefix, g))
            .collect();
        let _: i64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .context("group lock delete failed")?;
        Ok(())
    }

    async fn release_messages_and_group_locks(&self, messages: &[Message]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut groups: Vec<String> = messages.iter().filter_map(|m| m.group_id.clone()).collect();
        groups.sort();
        groups.dedup();

        let mut invocation = self.release_combined_script.prepare_invoke();
        invocation
            .key(&self.keys.pending)
            .key(&self.keys.captured)
            .arg(&self.keys.msg_prefix)
            .arg(&self.keys.lock_prefix)
            .arg(messages.len());
        for message in messages {
            invocation.arg(message.id.to_string());
        }
        invocation.arg(groups.len());
        for group in &groups {
            invocation.arg(group);
        }

        let mut conn = self.conn.clone();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .context("combined release script failed")?;
        Ok(())
    }

    /// Dedup guards expire via key TTL; there is nothing to sweep.
    async fn delete_expired_deduplications(
        &self,
        _cutoff: DateTime<Utc>,
        _batch: u32,
    ) -> anyhow::Result<u64> {
        Ok(0)
    }

    /// Group locks expire via key TTL; there is nothing to sweep.
    async fn delete_expired_group_locks(
        &self,
        _cutoff: DateTime<Utc>,
        _batch: u32,
    ) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn delete_expired_dead_letters(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
    ) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .cleanup_dead_script
            .key(&self.keys.dead)
            .arg(&self.keys.dead_prefix)
            .arg(to_millis(cutoff))
            .arg(batch)
            .invoke_async(&mut conn)
            .await
            .context("dead letter cleanup script failed")?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_prefixed_per_inbox() {
        let keys = Keys::new("orders");
        assert_eq!(keys.pending, "ibx:orders:pending");
        assert_eq!(keys.captured, "ibx:orders:captured");
        assert_eq!(keys.msg_prefix, "ibx:orders:msg:");
        assert_eq!(keys.lock_prefix, "ibx:orders:lock:");
        assert_eq!(keys.dedup_prefix, "ibx:orders:dedup:");
        assert_eq!(keys.dead, "ibx:orders:dead");
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let restored = from_millis(to_millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn classifier_spots_transient_kinds() {
        let classifier = RedisErrorClassifier;
        let err = anyhow::Error::new(redis::RedisError::from((
            redis::ErrorKind::BusyLoadingError,
            "server loading",
        )));
        assert!(classifier.is_transient(&err));

        let err = anyhow::Error::new(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "wrong type",
        )));
        assert!(!classifier.is_transient(&err));

        let err = anyhow::anyhow!("not a redis error");
        assert!(!classifier.is_transient(&err));
    }
}
