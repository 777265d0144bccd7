//! Serializer/deserializer contract.
//!
//! Transports convert between JSON values and typed packets through an
//! injected pair of pure functions. The JSON defaults below are used unless
//! a caller supplies its own.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::Result;

/// Outbound conversion: typed packet → JSON value.
pub trait Serializer<T>: Send + Sync {
    /// Serialize `value` for the wire.
    fn serialize(&self, value: &T) -> Result<Value>;
}

/// Inbound conversion: JSON value → typed packet.
pub trait Deserializer<T>: Send + Sync {
    /// Deserialize a decoded wire value.
    fn deserialize(&self, raw: Value) -> Result<T>;
}

/// Serde-based serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T: Serialize> Serializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }
}

/// Serde-based deserializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDeserializer;

impl<T: DeserializeOwned> Deserializer<T> for JsonDeserializer {
    fn deserialize(&self, raw: Value) -> Result<T> {
        Ok(serde_json::from_value(raw)?)
    }
}
