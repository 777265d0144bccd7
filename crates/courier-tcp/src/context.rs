//! Per-message context handed to TCP handlers.

use std::net::SocketAddr;

/// Where a TCP message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpContext {
    peer: SocketAddr,
    pattern: String,
}

impl TcpContext {
    /// Context for a message from `peer` matched under `pattern`.
    pub fn new(peer: SocketAddr, pattern: impl Into<String>) -> Self {
        Self {
            peer,
            pattern: pattern.into(),
        }
    }

    /// Remote address of the sending socket.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Canonical pattern of the message.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
