//! Backpressured response writing.
//!
//! [`write_to_sink`] drains a handler's reply sequence into a [`CallSink`]
//! whose `write` reports when its buffer is full. While the sink is full,
//! produced values queue up locally and are flushed front to back once the
//! sink signals it has drained. Completion and errors that arrive while
//! values are still queued are deferred until the queue is flushed. Peer
//! cancellation stops the producer at once and is not an error. Every path
//! ends the sink exactly once.
//!
//! [`ResponseSink`] is the sink used for gRPC response streams: a bounded
//! queue with a high-water mark, read by the stream handed to `tonic`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{HandlerError, ReplyStream};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::Status;

use crate::errors::status_from_error;

/// Default number of responses buffered per call before `write` reports
/// backpressure.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// An outbound stream that can refuse more data for a while.
#[async_trait]
pub trait CallSink: Send + Sync {
    /// Accept `value`. Returns `false` once the sink's buffer is full; the
    /// value itself is still accepted.
    fn write(&self, value: Value) -> bool;

    /// Fail the call.
    fn error(&self, err: HandlerError);

    /// Finish the call.
    fn end(&self);

    /// Resolves once the sink can take more data.
    async fn drained(&self);
}

/// How [`write_to_sink`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The producer completed and everything was written.
    Completed,
    /// The producer failed; the error was sent after all earlier values.
    Failed,
    /// The peer cancelled the call.
    Cancelled,
}

enum Deferred {
    Complete,
    Error(HandlerError),
}

/// Drain `source` into `sink`, honoring the sink's backpressure.
pub async fn write_to_sink<S>(
    mut source: ReplyStream,
    sink: &S,
    cancelled: &CancellationToken,
) -> WriteOutcome
where
    S: CallSink + ?Sized,
{
    let mut queued: VecDeque<Value> = VecDeque::new();
    let mut writing = true;
    let mut deferred: Option<Deferred> = None;

    loop {
        tokio::select! {
            biased;
            () = cancelled.cancelled() => {
                sink.end();
                return WriteOutcome::Cancelled;
            }
            () = sink.drained(), if !writing => {
                writing = true;
                while let Some(value) = queued.pop_front() {
                    writing = sink.write(value);
                    if !writing {
                        break;
                    }
                }
                if writing {
                    match deferred.take() {
                        Some(Deferred::Complete) => {
                            sink.end();
                            return WriteOutcome::Completed;
                        }
                        Some(Deferred::Error(err)) => {
                            sink.error(err);
                            sink.end();
                            return WriteOutcome::Failed;
                        }
                        None => {}
                    }
                }
            }
            next = source.next(), if deferred.is_none() => match next {
                Some(Ok(value)) => {
                    if writing {
                        writing = sink.write(value);
                    } else {
                        queued.push_back(value);
                    }
                }
                Some(Err(err)) => {
                    if queued.is_empty() {
                        sink.error(err);
                        sink.end();
                        return WriteOutcome::Failed;
                    }
                    deferred = Some(Deferred::Error(err));
                }
                None => {
                    if queued.is_empty() {
                        sink.end();
                        return WriteOutcome::Completed;
                    }
                    deferred = Some(Deferred::Complete);
                }
            },
        }
    }
}

/// Response stream handed to `tonic`.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Value, Status>> + Send>>;

struct Queue {
    items: VecDeque<Result<Value, Status>>,
    ended: bool,
    reader_gone: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    readable: Notify,
    writable: Notify,
    high_water_mark: usize,
}

/// Writable end of a gRPC response stream.
///
/// Once the reading side is gone (the peer went away or the call was
/// torn down), writes are discarded and `drained` resolves immediately.
#[derive(Clone)]
pub struct ResponseSink {
    shared: Arc<Shared>,
}

impl ResponseSink {
    /// A sink and the stream that reads it. Dropping the stream before the
    /// sink ends cancels `cancel`.
    pub fn channel(high_water_mark: usize, cancel: CancellationToken) -> (Self, ResponseStream) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                ended: false,
                reader_gone: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            high_water_mark: high_water_mark.max(1),
        });
        let reader = Reader {
            shared: Arc::clone(&shared),
            guard: Some(cancel.drop_guard()),
        };
        (Self { shared }, reader.into_stream())
    }

    /// Responses waiting to be read.
    pub fn buffered(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    fn push(&self, item: Result<Value, Status>) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.ended || queue.reader_gone {
            return true;
        }
        queue.items.push_back(item);
        let below_mark = queue.items.len() < self.shared.high_water_mark;
        drop(queue);
        self.shared.readable.notify_one();
        below_mark
    }
}

#[async_trait]
impl CallSink for ResponseSink {
    fn write(&self, value: Value) -> bool {
        self.push(Ok(value))
    }

    fn error(&self, err: HandlerError) {
        let _ = self.push(Err(status_from_error(&err)));
    }

    fn end(&self) {
        self.shared.queue.lock().ended = true;
        self.shared.readable.notify_one();
    }

    async fn drained(&self) {
        loop {
            {
                let queue = self.shared.queue.lock();
                if queue.reader_gone || queue.items.len() < self.shared.high_water_mark {
                    return;
                }
            }
            self.shared.writable.notified().await;
        }
    }
}

struct Reader {
    shared: Arc<Shared>,
    guard: Option<DropGuard>,
}

enum Next {
    Item(Result<Value, Status>),
    End,
    Wait,
}

impl Reader {
    fn into_stream(self) -> ResponseStream {
        let mut reader = self;
        Box::pin(async_stream::stream! {
            loop {
                let next = {
                    let mut queue = reader.shared.queue.lock();
                    match queue.items.pop_front() {
                        Some(item) => Next::Item(item),
                        None if queue.ended => Next::End,
                        None => Next::Wait,
                    }
                };
                match next {
                    Next::Item(item) => {
                        reader.shared.writable.notify_one();
                        if item.is_err() {
                            reader.disarm();
                        }
                        yield item;
                    }
                    Next::End => {
                        reader.disarm();
                        break;
                    }
                    Next::Wait => reader.shared.readable.notified().await,
                }
            }
        })
    }

    fn disarm(&mut self) {
        if let Some(guard) = self.guard.take() {
            let _ = guard.disarm();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shared.queue.lock().reader_gone = true;
        self.shared.writable.notify_one();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Reply, into_stream};
    use futures::stream;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Sink whose `write` returns false from the `full_after`-th call until
    /// `release` is called.
    struct ScriptedSink {
        state: Mutex<ScriptedState>,
        released: Notify,
    }

    #[derive(Default)]
    struct ScriptedState {
        log: Vec<String>,
        calls: usize,
        full_after: usize,
        accepting: bool,
        ends: usize,
    }

    impl ScriptedSink {
        fn new(full_after: usize) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(ScriptedState {
                    full_after,
                    accepting: true,
                    ..ScriptedState::default()
                }),
                released: Notify::new(),
            })
        }

        fn release(&self) {
            self.state.lock().accepting = true;
            self.released.notify_one();
        }

        fn log(&self) -> Vec<String> {
            self.state.lock().log.clone()
        }

        fn calls(&self) -> usize {
            self.state.lock().calls
        }

        fn ends(&self) -> usize {
            self.state.lock().ends
        }
    }

    #[async_trait]
    impl CallSink for ScriptedSink {
        fn write(&self, value: Value) -> bool {
            let mut state = self.state.lock();
            state.calls += 1;
            state.log.push(format!("write {value}"));
            if state.calls == state.full_after {
                state.accepting = false;
            }
            state.accepting
        }

        fn error(&self, err: HandlerError) {
            self.state.lock().log.push(format!("error {err}"));
        }

        fn end(&self) {
            let mut state = self.state.lock();
            state.ends += 1;
            state.log.push("end".into());
        }

        async fn drained(&self) {
            loop {
                if self.state.lock().accepting {
                    return;
                }
                self.released.notified().await;
            }
        }
    }

    async fn settle(sink: &ScriptedSink, calls: usize) {
        for _ in 0..100 {
            if sink.calls() >= calls {
                break;
            }
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn numbers(n: i64) -> ReplyStream {
        into_stream(Ok(Reply::values((1..=n).map(|v| json!(v)))))
    }

    // ── write_to_sink ──

    #[tokio::test]
    async fn all_values_written_in_order_after_drain() {
        let sink = ScriptedSink::new(3);
        let token = CancellationToken::new();
        let task = {
            let sink = Arc::clone(&sink);
            let token = token.clone();
            tokio::spawn(async move { write_to_sink(numbers(10), &*sink, &token).await })
        };

        settle(&sink, 3).await;
        assert_eq!(sink.calls(), 3);
        assert_eq!(sink.ends(), 0);

        sink.release();
        assert_eq!(task.await.unwrap(), WriteOutcome::Completed);

        let expected: Vec<String> = (1..=10)
            .map(|v| format!("write {v}"))
            .chain(std::iter::once("end".to_owned()))
            .collect();
        assert_eq!(sink.log(), expected);
        assert_eq!(sink.ends(), 1);
    }

    #[tokio::test]
    async fn completion_without_backpressure_ends_immediately() {
        let sink = ScriptedSink::new(usize::MAX);
        let outcome = write_to_sink(numbers(3), &*sink, &CancellationToken::new()).await;
        assert_eq!(outcome, WriteOutcome::Completed);
        assert_eq!(sink.log(), vec!["write 1", "write 2", "write 3", "end"]);
    }

    #[tokio::test]
    async fn error_with_empty_queue_is_sent_at_once() {
        let sink = ScriptedSink::new(usize::MAX);
        let source = into_stream(Ok(Reply::stream(stream::iter(vec![
            Ok(json!(1)),
            Err(HandlerError::rpc("bad")),
        ]))));
        let outcome = write_to_sink(source, &*sink, &CancellationToken::new()).await;
        assert_eq!(outcome, WriteOutcome::Failed);
        assert_eq!(sink.log(), vec!["write 1", r#"error "bad""#, "end"]);
    }

    #[tokio::test]
    async fn error_waits_for_queued_values() {
        let sink = ScriptedSink::new(1);
        let token = CancellationToken::new();
        let source = into_stream(Ok(Reply::stream(stream::iter(vec![
            Ok(json!(1)),
            Ok(json!(2)),
            Ok(json!(3)),
            Err(HandlerError::rpc("late")),
        ]))));
        let task = {
            let sink = Arc::clone(&sink);
            let token = token.clone();
            tokio::spawn(async move { write_to_sink(source, &*sink, &token).await })
        };

        settle(&sink, 1).await;
        assert_eq!(sink.log(), vec!["write 1"]);

        sink.release();
        assert_eq!(task.await.unwrap(), WriteOutcome::Failed);
        assert_eq!(
            sink.log(),
            vec!["write 1", "write 2", "write 3", r#"error "late""#, "end"]
        );
    }

    #[tokio::test]
    async fn empty_sequence_just_ends() {
        let sink = ScriptedSink::new(usize::MAX);
        let outcome =
            write_to_sink(into_stream(Ok(Reply::Empty)), &*sink, &CancellationToken::new()).await;
        assert_eq!(outcome, WriteOutcome::Completed);
        assert_eq!(sink.log(), vec!["end"]);
    }

    #[tokio::test]
    async fn cancellation_stops_producer_without_error() {
        let sink = ScriptedSink::new(usize::MAX);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel::<Value>();
        let source: ReplyStream = Box::pin(UnboundedReceiverStream::new(rx).map(Ok));
        tx.send(json!(1)).unwrap();
        tx.send(json!(2)).unwrap();

        let task = {
            let sink = Arc::clone(&sink);
            let token = token.clone();
            tokio::spawn(async move { write_to_sink(source, &*sink, &token).await })
        };
        settle(&sink, 2).await;

        token.cancel();
        assert_eq!(task.await.unwrap(), WriteOutcome::Cancelled);
        assert_eq!(sink.log(), vec!["write 1", "write 2", "end"]);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn cancellation_beats_pending_drain() {
        let sink = ScriptedSink::new(1);
        let token = CancellationToken::new();
        let task = {
            let sink = Arc::clone(&sink);
            let token = token.clone();
            tokio::spawn(async move { write_to_sink(numbers(5), &*sink, &token).await })
        };
        settle(&sink, 1).await;

        token.cancel();
        assert_eq!(task.await.unwrap(), WriteOutcome::Cancelled);
        assert_eq!(sink.log(), vec!["write 1", "end"]);
        assert_eq!(sink.ends(), 1);
    }

    // ── ResponseSink ──

    #[tokio::test]
    async fn write_reports_high_water_mark() {
        let (sink, _stream) = ResponseSink::channel(2, CancellationToken::new());
        assert!(sink.write(json!(1)));
        assert!(!sink.write(json!(2)));
        assert_eq!(sink.buffered(), 2);
    }

    #[tokio::test]
    async fn reading_drains_the_sink() {
        let (sink, mut stream) = ResponseSink::channel(1, CancellationToken::new());
        assert!(!sink.write(json!("a")));

        let drained = tokio::spawn({
            let sink = sink.clone();
            async move { sink.drained().await }
        });
        assert_eq!(stream.next().await.unwrap().unwrap(), json!("a"));
        drained.await.unwrap();
        assert_eq!(sink.buffered(), 0);
    }

    #[tokio::test]
    async fn error_then_end_closes_stream() {
        let (sink, stream) = ResponseSink::channel(8, CancellationToken::new());
        let _ = sink.write(json!(1));
        sink.error(HandlerError::rpc(json!({"code": 9, "message": "precondition"})));
        sink.end();

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert_eq!(
            items[1].as_ref().unwrap_err().code(),
            tonic::Code::FailedPrecondition
        );
    }

    #[tokio::test]
    async fn dropping_stream_cancels_call() {
        let token = CancellationToken::new();
        let (sink, stream) = ResponseSink::channel(1, token.clone());
        let _ = sink.write(json!(1));
        drop(stream);

        assert!(token.is_cancelled());
        assert!(sink.write(json!(2)));
        sink.drained().await;
    }

    #[tokio::test]
    async fn finished_stream_does_not_cancel() {
        let token = CancellationToken::new();
        let (sink, stream) = ResponseSink::channel(4, token.clone());
        let _ = sink.write(json!(1));
        sink.end();

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn writer_and_reader_cooperate() {
        let token = CancellationToken::new();
        let (sink, stream) = ResponseSink::channel(2, token.clone());
        let writer = tokio::spawn({
            let token = token.clone();
            async move { write_to_sink(numbers(50), &sink, &token).await }
        });

        let items: Vec<Value> = stream.map(Result::unwrap).collect().await;
        assert_eq!(items, (1..=50).map(|v| json!(v)).collect::<Vec<_>>());
        assert_eq!(writer.await.unwrap(), WriteOutcome::Completed);
    }
}
