//! Message handlers and result normalization.
//!
//! A handler returns a single value, a lazy sequence of values, nothing, or
//! an error. [`into_stream`] folds all four shapes into one [`ReplyStream`]
//! so downstream code never distinguishes between them, and
//! [`response_packets`] turns that stream into the reply packets sent over
//! request/response transports.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde_json::Value;

use crate::errors::HandlerError;
use crate::packet::ResponsePacket;

/// Normalized handler output: a lazy, possibly infinite, sequence.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Value, HandlerError>> + Send>>;

/// What a handler produced.
pub enum Reply {
    /// A single value.
    Value(Value),
    /// A sequence of values.
    Stream(ReplyStream),
    /// No value at all.
    Empty,
}

impl Reply {
    /// Wrap any `Send` stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// A finite sequence of already-computed values.
    pub fn values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::stream(stream::iter(values.into_iter().map(Ok)))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

/// Application code bound to a pattern.
///
/// `P` is the payload type and `C` the per-message context; each transport
/// picks its own (TCP and AMQP hand over JSON, gRPC may hand over an inbound
/// stream or the raw call).
#[async_trait]
pub trait MessageHandler<P, C>: Send + Sync {
    /// Handle one message.
    async fn handle(&self, payload: P, ctx: C) -> Result<Reply, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<P, C, F, Fut> MessageHandler<P, C> for FnHandler<F>
where
    P: Send + 'static,
    C: Send + 'static,
    F: Fn(P, C) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Reply, HandlerError>> + Send,
{
    async fn handle(&self, payload: P, ctx: C) -> Result<Reply, HandlerError> {
        (self.0)(payload, ctx).await
    }
}

/// Adapt an async closure into a shareable handler.
pub fn handler_fn<P, C, F, Fut>(f: F) -> Arc<dyn MessageHandler<P, C>>
where
    P: Send + 'static,
    C: Send + 'static,
    F: Fn(P, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Normalize any handler outcome into a [`ReplyStream`].
pub fn into_stream(result: Result<Reply, HandlerError>) -> ReplyStream {
    match result {
        Ok(Reply::Value(value)) => Box::pin(stream::iter([Ok(value)])),
        Ok(Reply::Stream(stream)) => stream,
        Ok(Reply::Empty) => Box::pin(stream::empty()),
        Err(err) => Box::pin(stream::iter([Err(err)])),
    }
}

/// Convert a normalized sequence into the reply packets for request `id`.
///
/// Values are held back by one position so the last one can be marked
/// `disposed`. An empty sequence yields a single disposed marker; an error
/// flushes the held value, then yields a terminal error packet.
pub fn response_packets(
    id: String,
    mut source: ReplyStream,
) -> impl Stream<Item = ResponsePacket> + Send {
    async_stream::stream! {
        let mut held: Option<Value> = None;
        let mut failure: Option<HandlerError> = None;
        while let Some(item) = source.next().await {
            match item {
                Ok(value) => {
                    if let Some(previous) = held.replace(value) {
                        yield ResponsePacket::value(id.clone(), previous, false);
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        match (held, failure) {
            (Some(previous), Some(err)) => {
                yield ResponsePacket::value(id.clone(), previous, false);
                yield ResponsePacket::error(id, err.to_wire());
            }
            (None, Some(err)) => yield ResponsePacket::error(id, err.to_wire()),
            (Some(last), None) => yield ResponsePacket::value(id, last, true),
            (None, None) => yield ResponsePacket::disposed(id),
        }
    }
}
