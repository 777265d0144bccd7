//! Per-message context handed to AMQP handlers.

use std::fmt;
use std::sync::Arc;

use crate::broker::{BrokerChannel, Delivery};
use crate::errors::Result;

/// Delivery metadata plus the channel it arrived on.
///
/// With `noAck: false`, handlers acknowledge through [`AmqpContext::ack`].
#[derive(Clone)]
pub struct AmqpContext {
    delivery_tag: u64,
    routing_key: String,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    pattern: String,
    channel: Arc<dyn BrokerChannel>,
}

impl AmqpContext {
    /// Context for `delivery`, matched under `pattern`.
    pub fn new(delivery: &Delivery, pattern: impl Into<String>, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.clone(),
            reply_to: delivery.reply_to.clone(),
            correlation_id: delivery.correlation_id.clone(),
            pattern: pattern.into(),
            channel,
        }
    }

    /// Channel-scoped delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Reply queue, if the publisher set one.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Correlation id, if the publisher set one.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Canonical pattern of the message.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The channel the message arrived on.
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.channel.ack(self.delivery_tag).await
    }

    /// Reject this delivery.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.channel.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for AmqpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpContext")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}
