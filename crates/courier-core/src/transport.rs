//! Capability interface implemented by each transport server.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::handler::MessageHandler;
use crate::packet::Pattern;
use crate::status::{ConnectionStatus, StatusPublisher};

/// A transport server: binds or connects, dispatches inbound messages to
/// registered handlers, and reports its connection status.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Payload type handed to handlers.
    type Payload: Send + 'static;
    /// Per-message context handed to handlers.
    type Context: Send + 'static;

    /// Register a handler. Handlers should be registered before `listen`.
    fn add_handler(
        &self,
        pattern: Pattern,
        handler: Arc<dyn MessageHandler<Self::Payload, Self::Context>>,
        is_event: bool,
    );

    /// Start serving. Resolves once the server is ready, or with the
    /// bind/connect error that prevented it.
    async fn listen(&self) -> Result<()>;

    /// Stop serving and release the underlying connection.
    async fn close(&self) -> Result<()>;

    /// Resolves once the server is permanently closed. Carries the terminal
    /// error when the close was caused by an exhausted retry budget.
    async fn closed(&self) -> Result<()>;

    /// Connection status publisher.
    fn status(&self) -> &StatusPublisher<ConnectionStatus>;
}

/// Accept errors that leave the listener usable.
///
/// Covers aborted handshakes and file-descriptor exhaustion (`ENFILE`,
/// `EMFILE`); an accept loop should log these and keep going.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(23 | 24))
}
