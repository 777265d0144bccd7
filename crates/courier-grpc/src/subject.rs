//! Two-phase buffer for inbound client streams.
//!
//! Until the handler side calls [`InboundStream::drain_buffer`], inbound
//! signals are appended to a replay buffer. Draining replays the buffer
//! once, in order, into a live channel, and every later signal is forwarded
//! to that channel directly. Nothing is dropped or reordered no matter when
//! the handler starts consuming.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::HandlerError;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Signal {
    Next(Value),
    Error(HandlerError),
    Complete,
}

enum Phase {
    Buffering(Vec<Signal>),
    Live,
}

struct Shared {
    phase: Mutex<Phase>,
    live: mpsc::UnboundedSender<Signal>,
}

impl Shared {
    fn push(&self, signal: Signal) {
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Buffering(buffer) => buffer.push(signal),
            Phase::Live => {
                let _ = self.live.send(signal);
            }
        }
    }

    fn drain(&self) {
        let mut phase = self.phase.lock();
        if let Phase::Buffering(buffer) = std::mem::replace(&mut *phase, Phase::Live) {
            for signal in buffer {
                let _ = self.live.send(signal);
            }
        }
    }
}

/// Producer side, fed by the transport.
#[derive(Clone)]
pub struct BufferedSubject {
    shared: Arc<Shared>,
}

impl BufferedSubject {
    /// Forward an inbound message.
    pub fn next(&self, value: Value) {
        self.shared.push(Signal::Next(value));
    }

    /// Forward a stream failure.
    pub fn error(&self, err: HandlerError) {
        self.shared.push(Signal::Error(err));
    }

    /// Mark the inbound stream complete.
    pub fn complete(&self) {
        self.shared.push(Signal::Complete);
    }

    /// Switch to live forwarding, replaying anything buffered.
    pub fn drain_buffer(&self) {
        self.shared.drain();
    }
}

/// Consumer side, handed to rx-stream handlers.
///
/// Yields inbound messages in arrival order. An error is yielded once and
/// ends the stream. The first poll drains the buffer.
pub struct InboundStream {
    shared: Arc<Shared>,
    live: mpsc::UnboundedReceiver<Signal>,
    finished: bool,
}

impl InboundStream {
    /// Switch to live forwarding, replaying anything buffered.
    pub fn drain_buffer(&self) {
        self.shared.drain();
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for InboundStream {
    type Item = Result<Value, HandlerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        self.shared.drain();
        match self.live.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Signal::Next(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Signal::Error(err))) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Signal::Complete) | None) => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

/// A connected producer/consumer pair, starting in the buffering phase.
pub fn buffered_subject() -> (BufferedSubject, InboundStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        phase: Mutex::new(Phase::Buffering(Vec::new())),
        live: tx,
    });
    (
        BufferedSubject {
            shared: Arc::clone(&shared),
        },
        InboundStream {
            shared,
            live: rx,
            finished: false,
        },
    )
}
