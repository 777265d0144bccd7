//! # courier-tcp
//!
//! TCP transport for courier.
//!
//! - [`server`]: [`TcpServer`], the listening side, with optional TLS and a
//!   bounded re-listen budget
//! - [`client`]: [`TcpClient`], a request/event proxy for the same wire format
//! - [`codec`]: the `<byte-length>#<json>` frame codec
//! - [`retry`]: re-listen bookkeeping
//!
//! Frames on one socket are dispatched in arrival order. Replies for
//! different requests may interleave; each carries the request id.

#![deny(unsafe_code)]

pub mod client;
pub mod codec;
pub mod connection;
pub mod context;
pub mod retry;
pub mod server;

pub use client::TcpClient;
pub use codec::{DEFAULT_MAX_FRAME_LENGTH, JsonSocketCodec};
pub use context::TcpContext;
pub use retry::{CloseAction, RetryState};
pub use server::{TcpServer, TcpServerBuilder};
