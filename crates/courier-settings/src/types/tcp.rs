//! TCP transport options.

use serde::{Deserialize, Serialize};

use super::TlsFiles;

/// Options recognized by the TCP transport server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpOptions {
    /// Bind host.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Re-listen budget after unintended closes. `0` disables retries.
    pub retry_attempts: u32,
    /// Delay before each re-listen, in milliseconds.
    pub retry_delay: u64,
    /// Serve TLS with this certificate and key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_options: Option<TlsFiles>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            retry_attempts: 0,
            retry_delay: 0,
            tls_options: None,
        }
    }
}

impl TcpOptions {
    /// `host:port` string for binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
