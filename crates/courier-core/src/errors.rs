//! Error taxonomy shared by every transport.

use serde_json::{Value, json};

// ── Error message constants ─────────────────────────────────────────

/// Reply body sent when a request names a pattern nobody handles.
pub const NO_MESSAGE_HANDLER: &str =
    "There is no matching message handler defined in the remote service.";
/// Message for a packet whose pattern or data is missing.
pub const INVALID_MESSAGE: &str = "The invalid data or message pattern (undefined/null)";
/// Message used when a broker connection could not be established.
pub const CONNECTION_FAILED_MESSAGE: &str =
    "Connection to transport failed. Trying to reconnect...";
/// Wire message for handler failures that carry no structured payload.
pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// Transport-level failures: configuration, binding, connecting, framing.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Invalid configuration detected before `listen`.
    #[error("invalid configuration: {message}")]
    Config {
        /// What is wrong with the supplied options.
        message: String,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address that was requested.
        address: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A broker or remote peer refused the connection.
    #[error("connection failed: {message}")]
    Connect {
        /// Underlying failure description.
        message: String,
    },

    /// Protobuf definitions could not be loaded.
    #[error("failed to load proto definitions: {message}")]
    ProtoLoad {
        /// Underlying failure description.
        message: String,
    },

    /// A configured proto package does not exist in the loaded definitions.
    #[error("the invalid gRPC package (package \"{package}\" not found)")]
    InvalidPackage {
        /// The package name that failed to resolve.
        package: String,
    },

    /// The reconnection budget ran out; the server is permanently closed.
    #[error("retry budget exhausted after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Number of re-listen/reconnect attempts made.
        attempts: u32,
    },

    /// A packet without a pattern or without data.
    #[error("{INVALID_MESSAGE}")]
    InvalidMessage,

    /// Encoding or decoding a wire message failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the malformed input.
        message: String,
    },

    /// The transport was closed while the operation was in progress.
    #[error("transport closed")]
    Closed,

    /// Socket-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Build a [`TransportError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Build a [`TransportError::Codec`].
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors produced by a handler while computing a reply.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Structured error payload, sent to the caller verbatim as `err`.
    #[error("{0}")]
    Rpc(Value),

    /// Unexpected failure; the caller only sees a generic message.
    #[error("{message}")]
    Internal {
        /// Description, logged but not sent.
        message: String,
    },

    /// The peer cancelled the call.
    #[error("call cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Build a [`HandlerError::Rpc`] from anything serializable into JSON.
    pub fn rpc(payload: impl Into<Value>) -> Self {
        Self::Rpc(payload.into())
    }

    /// Build a [`HandlerError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Value placed in `ResponsePacket.err`.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Rpc(payload) => payload.clone(),
            Self::Internal { .. } => json!({
                "status": "error",
                "message": INTERNAL_SERVER_ERROR,
            }),
            Self::Cancelled => json!({
                "status": "error",
                "message": "cancelled",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = TransportError::config("protoPath and packageDefinition are exclusive");
        assert_eq!(
            err.to_string(),
            "invalid configuration: protoPath and packageDefinition are exclusive"
        );
    }

    #[test]
    fn invalid_message_display() {
        assert_eq!(TransportError::InvalidMessage.to_string(), INVALID_MESSAGE);
    }

    #[test]
    fn invalid_package_display() {
        let err = TransportError::InvalidPackage {
            package: "hero".into(),
        };
        assert!(err.to_string().contains("\"hero\""));
    }

    #[test]
    fn json_error_becomes_codec() {
        let json_err = serde_json::from_str::<Value>("{").unwrap_err();
        let err: TransportError = json_err.into();
        assert!(matches!(err, TransportError::Codec { .. }));
    }

    #[test]
    fn rpc_error_is_sent_verbatim() {
        let err = HandlerError::rpc(json!({"code": 5, "message": "missing"}));
        assert_eq!(err.to_wire(), json!({"code": 5, "message": "missing"}));
    }

    #[test]
    fn internal_error_hides_details() {
        let err = HandlerError::internal("db pool exhausted");
        assert_eq!(err.to_string(), "db pool exhausted");
        assert_eq!(err.to_wire()["message"], INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn string_rpc_error_display() {
        let err = HandlerError::rpc("boom");
        assert_eq!(err.to_wire(), json!("boom"));
    }
}
