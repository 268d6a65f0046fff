//! The four delivery strategies.
//!
//! All strategies resolve handlers from the inbox dispatch table, bound each
//! handler invocation by `max_processing_time` (unless lock extension keeps
//! the lease fresh instead), turn undecodable payloads
//! into dead-letter moves (the payload will not change, so a retry cannot
//! help), and report every outcome through the processing context. The
//! returned group ids are those whose locks are safe to drop after the
//! batch commit: fully reported, nothing released for retry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::handler::{BatchCallResult, ErasedBatched, ErasedFifoBatched, ErasedSingle, HandlerKind, Outcome};
use crate::message::Message;
use crate::options::DeliveryMode;
use crate::processing::{deserialize_reason, ProcessingContext};

#[async_trait]
pub(crate) trait DeliveryStrategy: Send + Sync {
    /// Deliver one captured batch, reporting outcomes into `ctx`. Returns
    /// the group ids eligible for lock release after commit.
    async fn deliver(
        &self,
        ctx: &Arc<ProcessingContext>,
        batch: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<String>;
}

pub(crate) fn for_mode(mode: DeliveryMode) -> Arc<dyn DeliveryStrategy> {
    match mode {
        DeliveryMode::Default => Arc::new(DefaultStrategy),
        DeliveryMode::Batched => Arc::new(BatchedStrategy),
        DeliveryMode::Fifo => Arc::new(FifoStrategy),
        DeliveryMode::FifoBatched => Arc::new(FifoBatchedStrategy),
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// How a single delivery ended, from the group-ordering point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Success,
    /// Released for retry without an attempt bump.
    Released,
    /// Failed, dead-lettered, or timed out.
    Terminal,
}

/// Group a batch by key, preserving first-appearance order of groups and
/// capture order within each group.
fn group_by<F>(batch: Vec<Message>, key: F) -> Vec<(String, Vec<Message>)>
where
    F: Fn(&Message) -> String,
{
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Message>> = HashMap::new();
    for message in batch {
        let k = key(&message);
        if !groups.contains_key(&k) {
            order.push(k.clone());
        }
        groups.entry(k).or_default().push(message);
    }
    order
        .into_iter()
        .map(|k| {
            let msgs = groups.remove(&k).unwrap_or_default();
            (k, msgs)
        })
        .collect()
}

/// Invoke a single-message handler with the processing-time bound and
/// record the outcome.
async fn invoke_single(
    ctx: &ProcessingContext,
    erased: &Arc<dyn ErasedSingle>,
    message: &Message,
    cancel: &CancellationToken,
) -> Disposition {
    let options = &ctx.shared().options;
    let child = cancel.child_token();

    let result = match options.handler_timeout() {
        Some(limit) => tokio::select! {
            res = erased.call(message, child.clone()) => Some(res),
            _ = tokio::time::sleep(limit) => {
                child.cancel();
                None
            }
        },
        None => Some(erased.call(message, child.clone()).await),
    };

    match result {
        None => {
            warn!(
                inbox = %ctx.shared().name,
                message_id = %message.id,
                message_type = %message.message_type,
                "handler timed out"
            );
            ctx.record(message.id, Outcome::Failed);
            Disposition::Terminal
        }
        Some(Err(deser)) => {
            ctx.record_dead_letter(message.id, deserialize_reason(&deser));
            Disposition::Terminal
        }
        Some(Ok(outcome)) => {
            let disposition = match &outcome {
                Outcome::Success => Disposition::Success,
                Outcome::Retry => Disposition::Released,
                Outcome::Failed | Outcome::MoveToDeadLetter { .. } => Disposition::Terminal,
            };
            ctx.record(message.id, outcome);
            disposition
        }
    }
}

/// Record the result list of a batched handler call against the slice it
/// was given. Unreported messages are released; undecodable payloads are
/// dead-lettered.
fn record_batch_result(ctx: &ProcessingContext, slice: &[Message], result: BatchCallResult) {
    let mut reported: HashMap<Uuid, Outcome> = HashMap::with_capacity(result.outcomes.len());
    for item in result.outcomes {
        reported.insert(item.id, item.outcome);
    }

    let undecodable: HashMap<Uuid, String> = result.undecodable.into_iter().collect();

    for message in slice {
        if let Some(err) = undecodable.get(&message.id) {
            ctx.record_dead_letter(message.id, deserialize_reason(err));
        } else if let Some(outcome) = reported.remove(&message.id) {
            ctx.record(message.id, outcome);
        } else {
            ctx.record(message.id, Outcome::Retry);
        }
    }

    for id in reported.keys() {
        warn!(inbox = %ctx.shared().name, message_id = %id, "handler reported outcome for a message outside its batch");
    }
}

/// Record a terminal failure for every message of a slice (handler timeout
/// or missing handler).
fn fail_slice(ctx: &ProcessingContext, slice: &[Message]) {
    for message in slice {
        ctx.record(message.id, Outcome::Failed);
    }
}

fn handler_for<'a>(ctx: &'a ProcessingContext, message_type: &str) -> Option<&'a HandlerKind> {
    let handler = ctx.shared().handlers.get(message_type);
    if handler.is_none() {
        error!(
            inbox = %ctx.shared().name,
            message_type = %message_type,
            "no handler registered for captured message type"
        );
    }
    handler
}

// ---------------------------------------------------------------------------
// Default: per-type, one message per call
// ---------------------------------------------------------------------------

struct DefaultStrategy;

#[async_trait]
impl DeliveryStrategy for DefaultStrategy {
    async fn deliver(
        &self,
        ctx: &Arc<ProcessingContext>,
        batch: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let threads = ctx.shared().options.max_processing_threads;

        for (message_type, messages) in group_by(batch, |m| m.message_type.clone()) {
            if cancel.is_cancelled() {
                break;
            }

            let erased = match handler_for(ctx, &message_type) {
                Some(HandlerKind::Single(erased)) => Arc::clone(erased),
                Some(other) => {
                    error!(
                        inbox = %ctx.shared().name,
                        message_type = %message_type,
                        shape = other.shape(),
                        "handler shape does not match Default delivery"
                    );
                    fail_slice(ctx, &messages);
                    continue;
                }
                None => {
                    fail_slice(ctx, &messages);
                    continue;
                }
            };

            if threads > 1 && messages.len() > 1 {
                // Parallel across messages of one type, never across types.
                let mut set: JoinSet<()> = JoinSet::new();
                let mut iter = messages.into_iter();
                loop {
                    while set.len() < threads && !cancel.is_cancelled() {
                        let Some(message) = iter.next() else { break };
                        let ctx = Arc::clone(ctx);
                        let erased = Arc::clone(&erased);
                        let cancel = cancel.clone();
                        set.spawn(async move {
                            invoke_single(&ctx, &erased, &message, &cancel).await;
                        });
                    }
                    if set.join_next().await.is_none() {
                        break;
                    }
                }
            } else {
                for message in &messages {
                    if cancel.is_cancelled() {
                        break;
                    }
                    invoke_single(ctx, &erased, message, cancel).await;
                }
            }
        }

        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Batched: per-type, whole slice per call
// ---------------------------------------------------------------------------

struct BatchedStrategy;

#[async_trait]
impl DeliveryStrategy for BatchedStrategy {
    async fn deliver(
        &self,
        ctx: &Arc<ProcessingContext>,
        batch: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        for (message_type, messages) in group_by(batch, |m| m.message_type.clone()) {
            if cancel.is_cancelled() {
                break;
            }

            let erased = match handler_for(ctx, &message_type) {
                Some(HandlerKind::Batched(erased)) => Arc::clone(erased),
                Some(other) => {
                    error!(
                        inbox = %ctx.shared().name,
                        message_type = %message_type,
                        shape = other.shape(),
                        "handler shape does not match Batched delivery"
                    );
                    fail_slice(ctx, &messages);
                    continue;
                }
                None => {
                    fail_slice(ctx, &messages);
                    continue;
                }
            };

            let child = cancel.child_token();
            let result = match ctx.shared().options.handler_timeout() {
                Some(limit) => tokio::select! {
                    res = erased.call(&messages, child.clone()) => Some(res),
                    _ = tokio::time::sleep(limit) => {
                        child.cancel();
                        None
                    }
                },
                None => Some(erased.call(&messages, child.clone()).await),
            };

            match result {
                Some(result) => record_batch_result(ctx, &messages, result),
                None => {
                    warn!(
                        inbox = %ctx.shared().name,
                        message_type = %message_type,
                        count = messages.len(),
                        "batched handler timed out"
                    );
                    fail_slice(ctx, &messages);
                }
            }
        }

        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// FIFO helpers
// ---------------------------------------------------------------------------

/// Outcome of processing one group slice.
struct GroupRun {
    group_id: String,
    /// Lock may be dropped after commit: everything reported, nothing
    /// released for retry, not interrupted mid-group.
    releasable: bool,
}

/// Split a FIFO batch into per-group slices sorted by `(received_at, id)`.
/// Messages without a group id cannot legally exist on a FIFO inbox; they
/// are dead-lettered up front.
fn fifo_groups(ctx: &ProcessingContext, batch: Vec<Message>) -> Vec<(String, Vec<Message>)> {
    let mut keyed: Vec<Message> = Vec::with_capacity(batch.len());
    for message in batch {
        match &message.group_id {
            Some(g) if !g.is_empty() => keyed.push(message),
            _ => {
                error!(
                    inbox = %ctx.shared().name,
                    message_id = %message.id,
                    "message without group id captured on a FIFO inbox"
                );
                ctx.record_dead_letter(message.id, "Message has no group id".to_string());
            }
        }
    }

    let mut groups = group_by(keyed, |m| m.group_id.clone().unwrap_or_default());
    for (_, messages) in groups.iter_mut() {
        messages.sort_by_key(Message::order_key);
    }
    groups
}

/// Release every message of `rest` for retry, preserving their order for
/// the next capture cycle.
fn release_rest(ctx: &ProcessingContext, rest: &[Message]) {
    for message in rest {
        ctx.record(message.id, Outcome::Retry);
    }
}

// ---------------------------------------------------------------------------
// FIFO: per-group, strictly ordered, one message per call
// ---------------------------------------------------------------------------

struct FifoStrategy;

impl FifoStrategy {
    async fn run_group(
        ctx: Arc<ProcessingContext>,
        erased_by_type: HashMap<String, Option<Arc<dyn ErasedSingle>>>,
        group_id: String,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> GroupRun {
        let mut releasable = true;

        for (index, message) in messages.iter().enumerate() {
            if cancel.is_cancelled() {
                // Remaining messages stay in flight; the loop's drain path
                // releases them together with the group lock.
                return GroupRun {
                    group_id,
                    releasable: false,
                };
            }

            let erased = match erased_by_type.get(&message.message_type) {
                Some(Some(erased)) => Arc::clone(erased),
                _ => {
                    ctx.record(message.id, Outcome::Failed);
                    release_rest(&ctx, &messages[index + 1..]);
                    return GroupRun {
                        group_id,
                        releasable: messages.len() == index + 1,
                    };
                }
            };

            match invoke_single(&ctx, &erased, message, &cancel).await {
                Disposition::Success => {}
                Disposition::Released => {
                    release_rest(&ctx, &messages[index + 1..]);
                    return GroupRun {
                        group_id,
                        releasable: false,
                    };
                }
                Disposition::Terminal => {
                    // Strict ordering: nothing later in the group may run
                    // before this message is re-delivered or dead-lettered.
                    let rest = &messages[index + 1..];
                    release_rest(&ctx, rest);
                    releasable = rest.is_empty();
                    return GroupRun {
                        group_id,
                        releasable,
                    };
                }
            }
        }

        GroupRun {
            group_id,
            releasable,
        }
    }
}

#[async_trait]
impl DeliveryStrategy for FifoStrategy {
    async fn deliver(
        &self,
        ctx: &Arc<ProcessingContext>,
        batch: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let groups = fifo_groups(ctx, batch);
        let threads = ctx.shared().options.max_processing_threads;

        // Resolve handlers once; groups share the table.
        let mut erased_by_type: HashMap<String, Option<Arc<dyn ErasedSingle>>> = HashMap::new();
        for (_, messages) in &groups {
            for message in messages {
                erased_by_type
                    .entry(message.message_type.clone())
                    .or_insert_with(|| match handler_for(ctx, &message.message_type) {
                        Some(HandlerKind::FifoSingle(erased)) => Some(Arc::clone(erased)),
                        Some(other) => {
                            error!(
                                inbox = %ctx.shared().name,
                                message_type = %message.message_type,
                                shape = other.shape(),
                                "handler shape does not match Fifo delivery"
                            );
                            None
                        }
                        None => None,
                    });
            }
        }

        let mut releasable = Vec::new();
        let mut set: JoinSet<GroupRun> = JoinSet::new();
        let mut pending = groups.into_iter();

        loop {
            while set.len() < threads {
                let Some((group_id, messages)) = pending.next() else { break };
                let ctx = Arc::clone(ctx);
                let erased = erased_by_type.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    Self::run_group(ctx, erased, group_id, messages, cancel).await
                });
            }
            match set.join_next().await {
                Some(Ok(run)) => {
                    if run.releasable {
                        releasable.push(run.group_id);
                    }
                }
                Some(Err(err)) => {
                    error!(inbox = %ctx.shared().name, error = %err, "group task failed");
                }
                None => break,
            }
        }

        releasable
    }
}

// ---------------------------------------------------------------------------
// FIFO-Batched: per-group runs of one message type, slice per call
// ---------------------------------------------------------------------------

struct FifoBatchedStrategy;

impl FifoBatchedStrategy {
    /// Split a group's ordered messages into runs of consecutive equal
    /// message type, so per-call batching never reorders the group.
    fn runs(messages: Vec<Message>) -> Vec<Vec<Message>> {
        let mut runs: Vec<Vec<Message>> = Vec::new();
        for message in messages {
            match runs.last_mut() {
                Some(run) if run[0].message_type == message.message_type => run.push(message),
                _ => runs.push(vec![message]),
            }
        }
        runs
    }

    async fn run_group(
        ctx: Arc<ProcessingContext>,
        erased_by_type: HashMap<String, Option<Arc<dyn ErasedFifoBatched>>>,
        group_id: String,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> GroupRun {
        let runs = Self::runs(messages);
        let total_runs = runs.len();

        for (run_index, run) in runs.iter().enumerate() {
            if cancel.is_cancelled() {
                return GroupRun {
                    group_id,
                    releasable: false,
                };
            }

            let stop = |ctx: &ProcessingContext, stopped_in_run: Option<usize>| {
                // Release whatever comes after the stopping point.
                if let Some(i) = stopped_in_run {
                    release_rest(ctx, &run[i..]);
                }
                for later in &runs[run_index + 1..] {
                    release_rest(ctx, later);
                }
            };

            let erased = match erased_by_type.get(&run[0].message_type) {
                Some(Some(erased)) => Arc::clone(erased),
                _ => {
                    fail_slice(&ctx, run);
                    stop(&ctx, None);
                    return GroupRun {
                        group_id,
                        releasable: run_index + 1 == total_runs,
                    };
                }
            };

            let child = cancel.child_token();
            let result = match ctx.shared().options.handler_timeout() {
                Some(limit) => tokio::select! {
                    res = erased.call(&group_id, run, child.clone()) => Some(res),
                    _ = tokio::time::sleep(limit) => {
                        child.cancel();
                        None
                    }
                },
                None => Some(erased.call(&group_id, run, child.clone()).await),
            };

            let Some(result) = result else {
                warn!(
                    inbox = %ctx.shared().name,
                    group_id = %group_id,
                    count = run.len(),
                    "fifo-batched handler timed out"
                );
                fail_slice(&ctx, run);
                stop(&ctx, None);
                return GroupRun {
                    group_id,
                    releasable: run_index + 1 == total_runs,
                };
            };

            let mut reported: HashMap<Uuid, Outcome> = HashMap::new();
            for item in result.outcomes {
                reported.insert(item.id, item.outcome);
            }
            let undecodable: HashMap<Uuid, String> = result.undecodable.into_iter().collect();

            // Walk the run in order so the first non-success message stops
            // the whole group.
            for (i, message) in run.iter().enumerate() {
                if let Some(err) = undecodable.get(&message.id) {
                    ctx.record_dead_letter(message.id, deserialize_reason(err));
                    stop(&ctx, Some(i + 1));
                    return GroupRun {
                        group_id,
                        releasable: run_index + 1 == total_runs && i + 1 == run.len(),
                    };
                }
                match reported.remove(&message.id) {
                    Some(Outcome::Success) => {
                        ctx.record(message.id, Outcome::Success);
                    }
                    Some(outcome) => {
                        let was_retry = outcome == Outcome::Retry;
                        ctx.record(message.id, outcome);
                        stop(&ctx, Some(i + 1));
                        let last = run_index + 1 == total_runs && i + 1 == run.len();
                        return GroupRun {
                            group_id,
                            releasable: last && !was_retry,
                        };
                    }
                    None => {
                        ctx.record(message.id, Outcome::Retry);
                        stop(&ctx, Some(i + 1));
                        return GroupRun {
                            group_id,
                            releasable: false,
                        };
                    }
                }
            }
        }

        GroupRun {
            group_id,
            releasable: true,
        }
    }
}

#[async_trait]
impl DeliveryStrategy for FifoBatchedStrategy {
    async fn deliver(
        &self,
        ctx: &Arc<ProcessingContext>,
        batch: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let groups = fifo_groups(ctx, batch);
        let threads = ctx.shared().options.max_processing_threads;

        let mut erased_by_type: HashMap<String, Option<Arc<dyn ErasedFifoBatched>>> = HashMap::new();
        for (_, messages) in &groups {
            for message in messages {
                erased_by_type
                    .entry(message.message_type.clone())
                    .or_insert_with(|| match handler_for(ctx, &message.message_type) {
                        Some(HandlerKind::FifoBatched(erased)) => Some(Arc::clone(erased)),
                        Some(other) => {
                            error!(
                                inbox = %ctx.shared().name,
                                message_type = %message.message_type,
                                shape = other.shape(),
                                "handler shape does not match FifoBatched delivery"
                            );
                            None
                        }
                        None => None,
                    });
            }
        }

        let mut releasable = Vec::new();
        let mut set: JoinSet<GroupRun> = JoinSet::new();
        let mut pending = groups.into_iter();

        loop {
            while set.len() < threads {
                let Some((group_id, messages)) = pending.next() else { break };
                let ctx = Arc::clone(ctx);
                let erased = erased_by_type.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    Self::run_group(ctx, erased, group_id, messages, cancel).await
                });
            }
            match set.join_next().await {
                Some(Ok(run)) => {
                    if run.releasable {
                        releasable.push(run.group_id);
                    }
                }
                Some(Err(err)) => {
                    error!(inbox = %ctx.shared().name, error = %err, "group task failed");
                }
                None => break,
            }
        }

        releasable
    }
}
