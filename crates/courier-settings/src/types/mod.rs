//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with the production defaults, so partial JSON is accepted and
//! missing fields fall back to their default.

mod amqp;
mod grpc;
mod tcp;

pub use amqp::*;
pub use grpc::*;
pub use tcp::*;

use std::path::PathBuf;

use courier_logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "logging": { "level": "debug" },
///   "tcp": { "port": 4000, "retryAttempts": 3, "retryDelay": 500 },
///   "amqp": { "queue": "orders", "wildcards": true }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// TCP transport options.
    pub tcp: TcpOptions,
    /// AMQP transport options.
    pub amqp: AmqpOptions,
    /// gRPC transport options.
    pub grpc: GrpcOptions,
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// PEM certificate chain and private key on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsFiles {
    /// Certificate chain (PEM).
    pub cert_path: PathBuf,
    /// Private key (PEM: PKCS#8, PKCS#1 or SEC1).
    pub key_path: PathBuf,
}
