//! The broker capability the server is written against.
//!
//! [`LapinConnector`](crate::lapin_broker::LapinConnector) talks to a real
//! broker; [`MemoryBroker`](crate::memory::MemoryBroker) records every call
//! for tests.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use courier_settings::{QueueOptions, SocketOptions};
use futures::Stream;
use futures::future::BoxFuture;

use crate::errors::{BrokerError, Result};

/// One message handed over by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack.
    pub delivery_tag: u64,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// Queue replies should go to.
    pub reply_to: Option<String>,
    /// Correlation id to copy onto replies.
    pub correlation_id: Option<String>,
}

/// Stream of deliveries from a consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// An open connection with one channel on it.
pub struct BrokerSession {
    /// The channel used for setup, consuming and replies.
    pub channel: Arc<dyn BrokerChannel>,
    /// Resolves when the connection drops.
    pub lost: BoxFuture<'static, BrokerError>,
}

/// Opens connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to `url` and open a channel.
    async fn connect(&self, url: &str, socket: &SocketOptions) -> Result<BrokerSession>;
}

/// The channel operations the server needs.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `queue`.
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    /// Declare a durable exchange of `kind`.
    async fn assert_exchange(&self, exchange: &str, kind: &str) -> Result<()>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries.
    async fn prefetch(&self, count: u16, global: bool) -> Result<()>;

    /// Start consuming `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
        no_ack: bool,
    ) -> Result<DeliveryStream>;

    /// Acknowledge one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject one delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Publish `body` straight to `queue` through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        correlation_id: Option<String>,
    ) -> Result<()>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<()>;
}
