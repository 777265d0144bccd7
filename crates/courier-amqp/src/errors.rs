//! Broker-level failures.

use courier_core::TransportError;

/// Failures reported by a [`BrokerConnector`](crate::broker::BrokerConnector)
/// or [`BrokerChannel`](crate::broker::BrokerChannel).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the handshake.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// URL that was tried, credentials stripped.
        url: String,
        /// Underlying failure description.
        message: String,
    },

    /// A channel operation was rejected.
    #[error("{operation} failed: {message}")]
    Channel {
        /// The AMQP method that failed.
        operation: &'static str,
        /// Underlying failure description.
        message: String,
    },

    /// An established connection went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The channel was closed locally.
    #[error("channel closed")]
    Closed,
}

impl BrokerError {
    /// Build a [`BrokerError::Channel`].
    pub fn channel(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Channel {
            operation,
            message: err.to_string(),
        }
    }
}

impl From<BrokerError> for TransportError {
    fn from(err: BrokerError) -> Self {
        Self::Connect {
            message: err.to_string(),
        }
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Strip `user:password@` from an AMQP URL before logging it.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_owned();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_owned(),
    }
}
