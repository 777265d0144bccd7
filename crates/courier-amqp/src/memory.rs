//! In-process broker that records every channel call.
//!
//! Used by the tests of this crate and by applications that want to drive
//! an [`AmqpServer`](crate::AmqpServer) without a running broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use courier_settings::{QueueOptions, SocketOptions};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::broker::{BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryStream};
use crate::errors::{BrokerError, Result};

/// A channel call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    /// `queue.declare`
    AssertQueue {
        /// Queue name.
        queue: String,
        /// Declared durable.
        durable: bool,
    },
    /// `exchange.declare`
    AssertExchange {
        /// Exchange name.
        exchange: String,
        /// Exchange kind.
        kind: String,
    },
    /// `queue.bind`
    BindQueue {
        /// Queue name.
        queue: String,
        /// Exchange name.
        exchange: String,
        /// Routing key.
        routing_key: String,
    },
    /// `basic.qos`
    Prefetch {
        /// Prefetch count.
        count: u16,
        /// Channel-wide.
        global: bool,
    },
    /// `basic.consume`
    Consume {
        /// Queue name.
        queue: String,
        /// Consumer tag, if one was given.
        consumer_tag: Option<String>,
        /// Auto-ack mode.
        no_ack: bool,
    },
    /// `basic.ack`
    Ack(u64),
    /// `basic.nack`
    Nack {
        /// Delivery tag.
        delivery_tag: u64,
        /// Requeue flag.
        requeue: bool,
    },
    /// `channel.close`
    Close,
}

/// A message published to a queue through the default exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    /// Destination queue.
    pub queue: String,
    /// Body, parsed as JSON.
    pub body: Value,
    /// Correlation id property.
    pub correlation_id: Option<String>,
}

/// Everything recorded so far.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// Channel calls, in order.
    pub ops: Vec<BrokerOp>,
    /// Published messages, in order.
    pub published: Vec<Published>,
}

impl Recorded {
    /// Whether `op` was recorded.
    pub fn has_op(&self, op: &BrokerOp) -> bool {
        self.ops.contains(op)
    }
}

struct State {
    refuse: AtomicBool,
    connect_attempts: AtomicU32,
    next_tag: AtomicU64,
    consumer: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    lost: Mutex<Option<oneshot::Sender<BrokerError>>>,
    recorded: watch::Sender<Recorded>,
}

impl State {
    fn record(&self, op: BrokerOp) {
        self.recorded.send_modify(|r| r.ops.push(op));
    }
}

/// Handle to the in-process broker. Clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<State>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A reachable broker with nothing recorded.
    pub fn new() -> Self {
        let (recorded, _) = watch::channel(Recorded::default());
        Self {
            state: Arc::new(State {
                refuse: AtomicBool::new(false),
                connect_attempts: AtomicU32::new(0),
                next_tag: AtomicU64::new(1),
                consumer: Mutex::new(None),
                lost: Mutex::new(None),
                recorded,
            }),
        }
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connection attempts made so far, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop the current connection as if the broker went away.
    pub fn drop_connection(&self) {
        let _ = self.state.consumer.lock().take();
        if let Some(tx) = self.state.lost.lock().take() {
            let _ = tx.send(BrokerError::ConnectionLost("connection reset by broker".into()));
        }
    }

    /// Deliver a message to the active consumer. Returns its delivery tag,
    /// or `None` when nobody is consuming.
    pub fn deliver(
        &self,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Option<u64> {
        let consumer = self.state.consumer.lock().clone()?;
        let delivery_tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            delivery_tag,
            routing_key: routing_key.to_owned(),
            body: body.into(),
            reply_to: reply_to.map(str::to_owned),
            correlation_id: correlation_id.map(str::to_owned),
        };
        consumer.send(delivery).ok().map(|()| delivery_tag)
    }

    /// Deliver a JSON body.
    pub fn deliver_json(
        &self,
        routing_key: &str,
        body: &Value,
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Option<u64> {
        self.deliver(routing_key, body.to_string(), reply_to, correlation_id)
    }

    /// Snapshot of everything recorded.
    pub fn recorded(&self) -> Recorded {
        self.state.recorded.borrow().clone()
    }

    /// Wait until `condition` holds for the recorded calls.
    pub async fn wait_until(&self, condition: impl Fn(&Recorded) -> bool) -> Recorded {
        let mut rx = self.state.recorded.subscribe();
        match rx.wait_for(|r| condition(r)).await {
            Ok(recorded) => recorded.clone(),
            Err(_) => self.recorded(),
        }
    }

    /// Whether a consumer is attached.
    pub fn is_consuming(&self) -> bool {
        self.state.consumer.lock().is_some()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, url: &str, _socket: &SocketOptions) -> Result<BrokerSession> {
        let _ = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect {
                url: url.to_owned(),
                message: "connection refused".into(),
            });
        }

        let (lost_tx, lost_rx) = oneshot::channel();
        *self.state.lost.lock() = Some(lost_tx);
        Ok(BrokerSession {
            channel: Arc::new(MemoryChannel {
                state: Arc::clone(&self.state),
            }),
            lost: Box::pin(async move { lost_rx.await.unwrap_or(BrokerError::Closed) }),
        })
    }
}

struct MemoryChannel {
    state: Arc<State>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.state.record(BrokerOp::AssertQueue {
            queue: queue.to_owned(),
            durable: options.durable,
        });
        Ok(())
    }

    async fn assert_exchange(&self, exchange: &str, kind: &str) -> Result<()> {
        self.state.record(BrokerOp::AssertExchange {
            exchange: exchange.to_owned(),
            kind: kind.to_owned(),
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.state.record(BrokerOp::BindQueue {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn prefetch(&self, count: u16, global: bool) -> Result<()> {
        self.state.record(BrokerOp::Prefetch { count, global });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
        no_ack: bool,
    ) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.consumer.lock() = Some(tx);
        self.state.record(BrokerOp::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.map(str::to_owned),
            no_ack,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.state.record(BrokerOp::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.state.record(BrokerOp::Nack {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        let body = serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
        let published = Published {
            queue: queue.to_owned(),
            body,
            correlation_id,
        };
        self.state
            .recorded
            .send_modify(|r| r.published.push(published));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.state.consumer.lock().take();
        let _ = self.state.lost.lock().take();
        self.state.record(BrokerOp::Close);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn refused_connections_count_attempts() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let result = broker.connect("amqp://x", &SocketOptions::default()).await;
        assert!(matches!(result, Err(BrokerError::Connect { .. })));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn deliveries_reach_consumer() {
        let broker = MemoryBroker::new();
        let session = broker.connect("amqp://x", &SocketOptions::default()).await.unwrap();
        let mut deliveries = session.channel.consume("q", None, true).await.unwrap();

        let tag = broker.deliver_json("k", &json!({"a": 1}), Some("replies"), Some("c1"));
        let delivery = deliveries.next().await.unwrap();
        assert_eq!(Some(delivery.delivery_tag), tag);
        assert_eq!(delivery.reply_to.as_deref(), Some("replies"));
        assert_eq!(delivery.body, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn deliver_without_consumer_is_none() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.deliver("k", "x", None, None), None);
    }

    #[tokio::test]
    async fn drop_connection_resolves_lost() {
        let broker = MemoryBroker::new();
        let session = broker.connect("amqp://x", &SocketOptions::default()).await.unwrap();
        broker.drop_connection();
        assert_matches!(session.lost.await, BrokerError::ConnectionLost(_));
    }

    #[tokio::test]
    async fn publish_is_recorded_as_json() {
        let broker = MemoryBroker::new();
        let session = broker.connect("amqp://x", &SocketOptions::default()).await.unwrap();
        session
            .channel
            .send_to_queue("replies", br#"{"id":"1"}"#.to_vec(), Some("c".into()))
            .await
            .unwrap();

        let recorded = broker.wait_until(|r| !r.published.is_empty()).await;
        assert_eq!(recorded.published[0].body, json!({"id": "1"}));
        assert_eq!(recorded.published[0].correlation_id.as_deref(), Some("c"));
    }
}
