//! [`BrokerConnector`] backed by `lapin`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_settings::{QueueOptions, SocketOptions};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryStream};
use crate::errors::{BrokerError, Result, redact_url};

/// Connects to a real broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, url: &str, socket: &SocketOptions) -> Result<BrokerSession> {
        let uri = with_heartbeat(url, socket.heartbeat_interval_in_seconds);
        let connect_error = |e: lapin::Error| BrokerError::Connect {
            url: redact_url(url),
            message: e.to_string(),
        };

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(connect_error)?;

        let (lost_tx, lost_rx) = oneshot::channel();
        let mut lost_tx = Some(lost_tx);
        connection.on_error(move |err| {
            if let Some(tx) = lost_tx.take() {
                let _ = tx.send(BrokerError::ConnectionLost(err.to_string()));
            }
        });

        let channel = connection.create_channel().await.map_err(connect_error)?;
        debug!(url = %redact_url(url), channel = channel.id(), "channel opened");

        Ok(BrokerSession {
            channel: Arc::new(LapinChannel {
                connection,
                channel,
            }),
            lost: Box::pin(async move { lost_rx.await.unwrap_or(BrokerError::Closed) }),
        })
    }
}

struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let _ = self
            .channel
            .queue_declare(queue, declare, field_table(&options.arguments))
            .await
            .map_err(|e| BrokerError::channel("queue.declare", e))?;
        Ok(())
    }

    async fn assert_exchange(&self, exchange: &str, kind: &str) -> Result<()> {
        let declare = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(exchange, exchange_kind(kind), declare, FieldTable::default())
            .await
            .map_err(|e| BrokerError::channel("exchange.declare", e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::channel("queue.bind", e))
    }

    async fn prefetch(&self, count: u16, global: bool) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|e| BrokerError::channel("basic.qos", e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: Option<&str>,
        no_ack: bool,
    ) -> Result<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag.unwrap_or_default(),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::channel("basic.consume", e))?;

        let deliveries = consumer.filter_map(|item| async move {
            match item {
                Ok(delivery) => Some(convert(delivery)),
                Err(err) => {
                    warn!(error = %err, "consumer error");
                    None
                }
            }
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::channel("basic.ack", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|e| BrokerError::channel("basic.nack", e))
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(id) = correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }
        let _ = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
            .await
            .map_err(|e| BrokerError::channel("basic.publish", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::channel("channel.close", e))?;
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::channel("connection.close", e))
    }
}

fn convert(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_owned(),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_owned()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        body: delivery.data,
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_owned()),
    }
}

/// Queue arguments as an AMQP field table. Nested objects and arrays are
/// not representable and are skipped.
fn field_table(arguments: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        match amqp_value(value) {
            Some(value) => {
                table.insert(ShortString::from(key.clone()), value);
            }
            None => warn!(argument = %key, "unsupported queue argument type, skipping"),
        }
    }
    table
}

fn amqp_value(value: &Value) -> Option<AMQPValue> {
    match value {
        Value::Bool(b) => Some(AMQPValue::Boolean(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(AMQPValue::LongLongInt)
            .or_else(|| n.as_f64().map(AMQPValue::Double)),
        Value::String(s) => Some(AMQPValue::LongString(LongString::from(s.clone()))),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn with_heartbeat(url: &str, heartbeat: Option<u16>) -> String {
    match heartbeat {
        Some(seconds) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}heartbeat={seconds}")
        }
        None => url.to_owned(),
    }
}
