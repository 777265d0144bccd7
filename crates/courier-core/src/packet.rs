//! Wire packets and the canonical pattern key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TransportError};

pub use crate::errors::NO_MESSAGE_HANDLER;

/// Key identifying which handler processes a message.
///
/// Plain strings are used as-is. Structured patterns (the gRPC
/// `{service, rpc, streaming}` triple, or any JSON object a client sends)
/// are normalized to JSON with lexicographically sorted keys, so two
/// clients that order fields differently still reach the same handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
    /// Opaque string route, e.g. `sum` or `orders.created`.
    Route(String),
    /// Structured pattern.
    Structured(Value),
}

impl Pattern {
    /// Canonical lookup key for this pattern.
    pub fn route(&self) -> String {
        match self {
            Self::Route(route) => route.clone(),
            Self::Structured(Value::String(route)) => route.clone(),
            Self::Structured(value) => canonical_json(value),
        }
    }

    /// Whether the pattern is missing (`null`).
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Structured(Value::Null))
    }
}

impl From<&str> for Pattern {
    fn from(route: &str) -> Self {
        Self::Route(route.to_owned())
    }
}

impl From<String> for Pattern {
    fn from(route: String) -> Self {
        Self::Route(route)
    }
}

impl From<Value> for Pattern {
    fn from(value: Value) -> Self {
        match value {
            Value::String(route) => Self::Route(route),
            other => Self::Structured(other),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.route())
    }
}

/// Serialize `value` as compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Inbound message: `{ pattern, data, id? }`.
///
/// A packet with an `id` is a request expecting exactly one terminal
/// reply; without one it is a fire-and-forget event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Routing key.
    pub pattern: Pattern,
    /// Application payload.
    #[serde(default)]
    pub data: Value,
    /// Correlation id for request/response exchanges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Packet {
    /// Build a request packet. Fails without side effects when either the
    /// pattern or the data is `null`.
    pub fn request(
        pattern: impl Into<Pattern>,
        data: Value,
        id: impl Into<String>,
    ) -> Result<Self> {
        let mut packet = Self::event(pattern, data)?;
        packet.id = Some(id.into());
        Ok(packet)
    }

    /// Build an event packet. Fails without side effects when either the
    /// pattern or the data is `null`.
    pub fn event(pattern: impl Into<Pattern>, data: Value) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_nil() || data.is_null() {
            return Err(TransportError::InvalidMessage);
        }
        Ok(Self {
            pattern,
            data,
            id: None,
        })
    }

    /// Whether this packet expects a reply.
    pub fn is_request(&self) -> bool {
        self.id.is_some()
    }
}

/// Outcome marker on a [`ResponsePacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The handler produced a value or completed.
    Success,
    /// The handler failed or no handler exists.
    Error,
}

/// Outbound reply: `{ id, response?, err?, status, disposed? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// Correlation id copied from the request.
    pub id: String,
    /// Produced value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    /// Success or error.
    pub status: ResponseStatus,
    /// Set on the last packet of an exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposed: Option<bool>,
}

impl ResponsePacket {
    /// A produced value. `last` marks the terminal emission.
    pub fn value(id: impl Into<String>, response: Value, last: bool) -> Self {
        Self {
            id: id.into(),
            response: Some(response),
            err: None,
            status: ResponseStatus::Success,
            disposed: last.then_some(true),
        }
    }

    /// Terminal error packet.
    pub fn error(id: impl Into<String>, err: Value) -> Self {
        Self {
            id: id.into(),
            response: None,
            err: Some(err),
            status: ResponseStatus::Error,
            disposed: Some(true),
        }
    }

    /// Terminal packet for a sequence that completed without a value.
    pub fn disposed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            response: None,
            err: None,
            status: ResponseStatus::Success,
            disposed: Some(true),
        }
    }

    /// Reply for a request whose pattern has no handler.
    pub fn no_handler(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            response: None,
            err: Some(Value::String(NO_MESSAGE_HANDLER.to_owned())),
            status: ResponseStatus::Error,
            disposed: None,
        }
    }

    /// Whether no further packets follow for this id.
    pub fn is_terminal(&self) -> bool {
        self.disposed == Some(true) || self.err.is_some()
    }
}
