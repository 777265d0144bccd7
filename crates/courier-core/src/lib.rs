//! # courier-core
//!
//! Transport-independent building blocks for the courier message-dispatch
//! server.
//!
//! - [`packet`]: inbound [`Packet`]s, outbound [`ResponsePacket`]s, and the
//!   canonical [`Pattern`] key
//! - [`handler`]: the [`MessageHandler`] trait and result normalization into
//!   a uniform [`ReplyStream`]
//! - [`dispatcher`]: the pattern → handler registry every transport composes
//! - [`wildcard`]: AMQP-style topic patterns compiled to anchored regexes
//! - [`status`]: the connection-status publisher
//! - [`codec`]: the injected serializer/deserializer pair
//! - [`transport`]: the capability trait each transport server implements
//!
//! Transports own their sockets, channels and clients; this crate owns the
//! dispatch semantics so that a handler behaves the same no matter which
//! wire it was reached through.

#![deny(unsafe_code)]

pub mod codec;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod packet;
pub mod status;
pub mod transport;
pub mod wildcard;

pub use codec::{Deserializer, JsonDeserializer, JsonSerializer, Serializer};
pub use dispatcher::{Dispatcher, EventOutcome, RegisteredHandler};
pub use errors::{HandlerError, Result, TransportError};
pub use handler::{MessageHandler, Reply, ReplyStream, handler_fn, into_stream, response_packets};
pub use packet::{NO_MESSAGE_HANDLER, Packet, Pattern, ResponsePacket, ResponseStatus, canonical_json};
pub use status::{ConnectionStatus, StatusPublisher, SubscriptionId};
pub use transport::{Transport, is_transient_accept_error};
pub use wildcard::{WildcardEntry, WildcardRouter, compile_routing_key, is_wildcard};
