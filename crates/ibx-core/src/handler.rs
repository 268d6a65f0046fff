//! Handler contracts and the erased dispatch table.
//!
//! Users implement one of the typed handler traits. Registration erases the
//! payload type into a closure-like object that deserializes the raw payload
//! and forwards to the typed handler, so steady-state dispatch is a map
//! lookup plus a virtual call — no reflection, no downcasting.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec;
use crate::message::Message;
use crate::registry::InboxMessage;

/// Per-message verdict returned by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Message is done; remove it from the store.
    Success,
    /// Attempt failed; bump the attempt counter and make the message
    /// pending again (dead-lettered once attempts reach the limit).
    Failed,
    /// Back off without consuming an attempt.
    Retry,
    /// Terminal rejection with an optional reason.
    MoveToDeadLetter { reason: Option<String> },
}

impl Outcome {
    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Outcome::MoveToDeadLetter {
            reason: Some(reason.into()),
        }
    }
}

/// One entry of a batched handler's result list.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub id: Uuid,
    pub outcome: Outcome,
}

/// A deserialized message plus its storage identity.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub id: Uuid,
    pub attempts_count: i32,
    pub group_id: Option<String>,
    pub message: T,
}

/// Handler for the Default and Fifo delivery modes: one message per call.
#[async_trait]
pub trait HandleSingle<T: InboxMessage>: Send + Sync {
    async fn handle(&self, envelope: Envelope<T>, cancel: CancellationToken) -> Outcome;
}

/// Handler for the Batched delivery mode: one per-type slice per call.
#[async_trait]
pub trait HandleBatched<T: InboxMessage>: Send + Sync {
    async fn handle(&self, batch: Vec<Envelope<T>>, cancel: CancellationToken)
        -> Vec<BatchOutcome>;
}

/// Handler for the FifoBatched delivery mode: one per-group slice per call.
#[async_trait]
pub trait HandleFifoBatched<T: InboxMessage>: Send + Sync {
    async fn handle(
        &self,
        group_id: &str,
        batch: Vec<Envelope<T>>,
        cancel: CancellationToken,
    ) -> Vec<BatchOutcome>;
}

// ---------------------------------------------------------------------------
// Erased layer
// ---------------------------------------------------------------------------

/// Result of a single erased dispatch. `Err` carries the deserialization
/// failure text; the strategy turns it into a dead-letter move, never a
/// retry, because the payload will not change.
pub(crate) type SingleCallResult = std::result::Result<Outcome, String>;

#[derive(Debug, Default)]
pub(crate) struct BatchCallResult {
    pub outcomes: Vec<BatchOutcome>,
    /// Messages whose payload failed to deserialize, excluded from the
    /// handler call.
    pub undecodable: Vec<(Uuid, String)>,
}

#[async_trait]
pub(crate) trait ErasedSingle: Send + Sync {
    async fn call(&self, message: &Message, cancel: CancellationToken) -> SingleCallResult;
}

#[async_trait]
pub(crate) trait ErasedBatched: Send + Sync {
    async fn call(&self, messages: &[Message], cancel: CancellationToken) -> BatchCallResult;
}

#[async_trait]
pub(crate) trait ErasedFifoBatched: Send + Sync {
    async fn call(
        &self,
        group_id: &str,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> BatchCallResult;
}

/// Tagged union over the four handler shapes, keyed by
/// `(inbox, message_type)` in the dispatch table.
#[derive(Clone)]
pub(crate) enum HandlerKind {
    Single(Arc<dyn ErasedSingle>),
    Batched(Arc<dyn ErasedBatched>),
    FifoSingle(Arc<dyn ErasedSingle>),
    FifoBatched(Arc<dyn ErasedFifoBatched>),
}

impl HandlerKind {
    pub(crate) fn shape(&self) -> &'static str {
        match self {
            HandlerKind::Single(_) => "single",
            HandlerKind::Batched(_) => "batched",
            HandlerKind::FifoSingle(_) => "fifo-single",
            HandlerKind::FifoBatched(_) => "fifo-batched",
        }
    }
}

fn envelope<T: InboxMessage>(message: &Message) -> std::result::Result<Envelope<T>, String> {
    let decoded: T = codec::decode(&message.payload).map_err(|e| e.to_string())?;
    Ok(Envelope {
        id: message.id,
        attempts_count: message.attempts_count,
        group_id: message.group_id.clone(),
        message: decoded,
    })
}

fn decode_batch<T: InboxMessage>(
    messages: &[Message],
) -> (Vec<Envelope<T>>, Vec<(Uuid, String)>) {
    let mut envelopes = Vec::with_capacity(messages.len());
    let mut undecodable = Vec::new();
    for message in messages {
        match envelope::<T>(message) {
            Ok(env) => envelopes.push(env),
            Err(err) => undecodable.push((message.id, err)),
        }
    }
    (envelopes, undecodable)
}

struct TypedSingle<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ErasedSingle for TypedSingle<T, H>
where
    T: InboxMessage,
    H: HandleSingle<T> + 'static,
{
    async fn call(&self, message: &Message, cancel: CancellationToken) -> SingleCallResult {
        let env = envelope::<T>(message)?;
        Ok(self.handler.handle(env, cancel).await)
    }
}

struct TypedBatched<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ErasedBatched for TypedBatched<T, H>
where
    T: InboxMessage,
    H: HandleBatched<T> + 'static,
{
    async fn call(&self, messages: &[Message], cancel: CancellationToken) -> BatchCallResult {
        let (envelopes, undecodable) = decode_batch::<T>(messages);
        let outcomes = if envelopes.is_empty() {
            Vec::new()
        } else {
            self.handler.handle(envelopes, cancel).await
        };
        BatchCallResult {
            outcomes,
            undecodable,
        }
    }
}

struct TypedFifoBatched<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ErasedFifoBatched for TypedFifoBatched<T, H>
where
    T: InboxMessage,
    H: HandleFifoBatched<T> + 'static,
{
    async fn call(
        &self,
        group_id: &str,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> BatchCallResult {
        let (envelopes, undecodable) = decode_batch::<T>(messages);
        let outcomes = if envelopes.is_empty() {
            Vec::new()
        } else {
            self.handler.handle(group_id, envelopes, cancel).await
        };
        BatchCallResult {
            outcomes,
            undecodable,
        }
    }
}

impl HandlerKind {
    pub(crate) fn single<T, H>(handler: H) -> Self
    where
        T: InboxMessage,
        H: HandleSingle<T> + 'static,
    {
        HandlerKind::Single(Arc::new(TypedSingle {
            handler,
            _marker: PhantomData,
        }))
    }

    pub(crate) fn batched<T, H>(handler: H) -> Self
    where
        T: InboxMessage,
        H: HandleBatched<T> + 'static,
    {
        HandlerKind::Batched(Arc::new(TypedBatched {
            handler,
            _marker: PhantomData,
        }))
    }

    pub(crate) fn fifo_single<T, H>(handler: H) -> Self
    where
        T: InboxMessage,
        H: HandleSingle<T> + 'static,
    {
        HandlerKind::FifoSingle(Arc::new(TypedSingle {
            handler,
            _marker: PhantomData,
        }))
    }

    pub(crate) fn fifo_batched<T, H>(handler: H) -> Self
    where
        T: InboxMessage,
        H: HandleFifoBatched<T> + 'static,
    {
        HandlerKind::FifoBatched(Arc::new(TypedFifoBatched {
            handler,
            _marker: PhantomData,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl InboxMessage for Ping {
        const MESSAGE_TYPE: &'static str = "ping";
    }

    struct EchoHandler;

    #[async_trait]
    impl HandleSingle<Ping> for EchoHandler {
        async fn handle(&self, envelope: Envelope<Ping>, _cancel: CancellationToken) -> Outcome {
            if envelope.message.seq % 2 == 0 {
                Outcome::Success
            } else {
                Outcome::Failed
            }
        }
    }

    fn raw(payload: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            inbox_name: "test".into(),
            message_type: "ping".into(),
            payload: payload.into(),
            group_id: None,
            collapse_key: None,
            deduplication_id: None,
            attempts_count: 0,
            received_at: Utc::now(),
            captured_at: None,
            captured_by: None,
        }
    }

    #[tokio::test]
    async fn erased_single_decodes_and_dispatches() {
        let kind = HandlerKind::single::<Ping, _>(EchoHandler);
        let HandlerKind::Single(erased) = kind else {
            panic!("expected single shape")
        };

        let outcome = erased
            .call(&raw(r#"{"seq":2}"#), CancellationToken::new())
            .await;
        assert_eq!(outcome.unwrap(), Outcome::Success);

        let outcome = erased
            .call(&raw(r#"{"seq":3}"#), CancellationToken::new())
            .await;
        assert_eq!(outcome.unwrap(), Outcome::Failed);
    }

    #[tokio::test]
    async fn deserialization_failure_is_reported_not_dispatched() {
        let kind = HandlerKind::single::<Ping, _>(EchoHandler);
        let HandlerKind::Single(erased) = kind else {
            panic!("expected single shape")
        };

        let outcome = erased
            .call(&raw("not json"), CancellationToken::new())
            .await;
        assert!(outcome.is_err());
    }
}
