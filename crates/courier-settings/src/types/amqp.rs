//! AMQP transport options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `maxConnectionAttempts` value meaning "retry forever".
pub const INFINITE_CONNECTION_ATTEMPTS: i32 = -1;

/// Options recognized by the AMQP transport server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmqpOptions {
    /// Broker URLs, tried in order on each connection attempt.
    pub urls: Vec<String>,
    /// Queue to consume from.
    pub queue: String,
    /// Queue declaration options.
    pub queue_options: QueueOptions,
    /// Consume without acknowledgements.
    pub no_ack: bool,
    /// Maximum unacknowledged deliveries. `0` means no limit.
    pub prefetch_count: u16,
    /// Apply the prefetch limit to the whole channel.
    pub is_global_prefetch_count: bool,
    /// Exchange to bind the queue to. Defaults to the queue name when an
    /// exchange is needed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    /// Exchange kind (`topic`, `direct`, `fanout`, `headers`).
    pub exchange_type: String,
    /// Routing key bound between the exchange and the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    /// Bind each registered pattern as a routing key and route with `*`/`#`.
    pub wildcards: bool,
    /// Connection attempts before giving up; [`INFINITE_CONNECTION_ATTEMPTS`]
    /// retries forever.
    pub max_connection_attempts: i32,
    /// Consumer tag; empty lets the broker pick one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
    /// Connection-level socket options.
    pub socket_options: SocketOptions,
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            urls: vec!["amqp://localhost".to_string()],
            queue: "default".to_string(),
            queue_options: QueueOptions::default(),
            no_ack: true,
            prefetch_count: 0,
            is_global_prefetch_count: false,
            exchange: None,
            exchange_type: "topic".to_string(),
            routing_key: None,
            wildcards: false,
            max_connection_attempts: INFINITE_CONNECTION_ATTEMPTS,
            consumer_tag: None,
            socket_options: SocketOptions::default(),
        }
    }
}

impl AmqpOptions {
    /// Attempt budget, or `None` when unlimited.
    pub fn connection_attempt_limit(&self) -> Option<u32> {
        u32::try_from(self.max_connection_attempts)
            .ok()
            .filter(|n| *n > 0)
    }

    /// Whether an exchange must be declared and bound.
    pub fn uses_exchange(&self) -> bool {
        self.exchange.is_some() || self.wildcards
    }

    /// Exchange name, falling back to the queue name.
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_deref().unwrap_or(&self.queue)
    }
}

/// Queue declaration options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Restrict to this connection.
    pub exclusive: bool,
    /// Delete when the last consumer goes away.
    pub auto_delete: bool,
    /// Skip declaring the queue (it must already exist).
    pub no_assert: bool,
    /// Extra `x-` arguments.
    pub arguments: BTreeMap<String, Value>,
}

/// Connection-level options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketOptions {
    /// AMQP heartbeat, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_in_seconds: Option<u16>,
    /// Wait between reconnection attempts, in seconds.
    pub reconnect_time_in_seconds: u64,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_in_seconds: None,
            reconnect_time_in_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = AmqpOptions::default();
        assert_eq!(opts.urls, vec!["amqp://localhost"]);
        assert_eq!(opts.queue, "default");
        assert!(opts.no_ack);
        assert_eq!(opts.prefetch_count, 0);
        assert_eq!(opts.exchange_type, "topic");
        assert_eq!(opts.max_connection_attempts, INFINITE_CONNECTION_ATTEMPTS);
        assert_eq!(opts.socket_options.reconnect_time_in_seconds, 5);
    }

    #[test]
    fn infinite_attempts_has_no_limit() {
        assert_eq!(AmqpOptions::default().connection_attempt_limit(), None);
    }

    #[test]
    fn bounded_attempts() {
        let opts = AmqpOptions {
            max_connection_attempts: 3,
            ..AmqpOptions::default()
        };
        assert_eq!(opts.connection_attempt_limit(), Some(3));
    }

    #[test]
    fn zero_attempts_is_unlimited() {
        let opts = AmqpOptions {
            max_connection_attempts: 0,
            ..AmqpOptions::default()
        };
        assert_eq!(opts.connection_attempt_limit(), None);
    }

    #[test]
    fn exchange_falls_back_to_queue() {
        let mut opts = AmqpOptions {
            queue: "orders".into(),
            ..AmqpOptions::default()
        };
        assert!(!opts.uses_exchange());
        opts.wildcards = true;
        assert!(opts.uses_exchange());
        assert_eq!(opts.exchange_name(), "orders");
        opts.exchange = Some("events".into());
        assert_eq!(opts.exchange_name(), "events");
    }

    #[test]
    fn camel_case_wire_names() {
        let opts: AmqpOptions = serde_json::from_str(
            r#"{
                "noAck": false,
                "prefetchCount": 10,
                "isGlobalPrefetchCount": true,
                "queueOptions": {"durable": true, "noAssert": true, "arguments": {"x-max-priority": 5}},
                "maxConnectionAttempts": 3,
                "socketOptions": {"heartbeatIntervalInSeconds": 30}
            }"#,
        )
        .unwrap();
        assert!(!opts.no_ack);
        assert_eq!(opts.prefetch_count, 10);
        assert!(opts.is_global_prefetch_count);
        assert!(opts.queue_options.durable);
        assert!(opts.queue_options.no_assert);
        assert_eq!(opts.queue_options.arguments["x-max-priority"], 5);
        assert_eq!(opts.socket_options.heartbeat_interval_in_seconds, Some(30));
        assert_eq!(opts.socket_options.reconnect_time_in_seconds, 5);
    }
}
