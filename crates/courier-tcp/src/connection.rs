//! Accepted socket state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound frames buffered per connection before handlers wait.
pub const OUTBOUND_BUFFER: usize = 256;

/// An accepted client socket.
///
/// Frames are handed to a dedicated writer task through a channel, so
/// replies from concurrently running handlers never interleave on the wire.
/// Handlers spawned for the connection stop once it is [closed](Self::close).
#[derive(Debug)]
pub struct Connection {
    /// Unique connection id.
    pub id: u64,
    /// Remote address.
    pub peer: SocketAddr,
    tx: mpsc::Sender<Value>,
    sent: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    /// Connection writing through `tx`.
    pub fn new(id: u64, peer: SocketAddr, tx: mpsc::Sender<Value>) -> Self {
        Self {
            id,
            peer,
            tx,
            sent: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a frame for writing, waiting if the writer is behind.
    ///
    /// Returns `false` once the socket is gone.
    pub async fn send(&self, frame: Value) -> bool {
        if self.tx.send(frame).await.is_ok() {
            let _ = self.sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Frames queued so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Mark the connection closed, ending the work running on its behalf.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once [`close`](Self::close) was called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_connection() -> (Connection, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(4);
        let conn = Connection::new(1, "127.0.0.1:9000".parse().unwrap(), tx);
        (conn, rx)
    }

    #[tokio::test]
    async fn send_reaches_writer() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send(json!({"id": "1"})).await);
        assert_eq!(rx.recv().await, Some(json!({"id": "1"})));
        assert_eq!(conn.sent_count(), 1);
    }

    #[tokio::test]
    async fn send_after_writer_gone_fails() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.send(json!(1)).await);
        assert_eq!(conn.sent_count(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let (conn, _rx) = make_connection();
        let conn = std::sync::Arc::new(conn);
        let waiter = {
            let conn = std::sync::Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn frames_keep_order() {
        let (conn, mut rx) = make_connection();
        for n in 0..4 {
            assert!(conn.send(json!(n)).await);
        }
        for n in 0..4 {
            assert_eq!(rx.recv().await, Some(json!(n)));
        }
    }
}
